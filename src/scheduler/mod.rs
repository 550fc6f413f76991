pub mod classifier;
pub mod job;
pub mod planner;
pub mod table;

pub use classifier::classify;
pub use job::{
    EntryPoint, Job, JobHandle, JobState, ResourceRequest, TaskRequirements, TaskSpec,
};
pub use planner::{plan, split_into_jobs, BatchPlan};
pub use table::JobTable;
