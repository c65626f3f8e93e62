mod operation;

pub use operation::{Operation, OperationGroup};
pub(crate) use operation::Resolution;
