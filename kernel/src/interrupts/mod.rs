mod page_fault;

pub use page_fault::{
    FaultResolution, PageFault, PageFaultErrorCode, PageFaultResolver, TerminationReason,
};
