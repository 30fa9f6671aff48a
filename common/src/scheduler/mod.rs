// Scheduler: cron timers, the trigger loop and the execution gate

pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod registry;

pub use coordinator::ExecutionCoordinator;
pub use engine::{EngineConfig, EngineDrivers, Scheduler, SchedulerEngine};
pub use registry::{ScheduleRegistry, ScheduleStatus, ScheduledEntry};
