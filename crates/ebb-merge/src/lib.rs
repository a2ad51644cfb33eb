pub mod apply;
pub mod plan;
pub mod report;

pub use apply::bulk_load;
pub use plan::{plan_update, UpdatePlan};
pub use report::{BulkLoadReport, ConstraintPolicy, MergeWarning};
