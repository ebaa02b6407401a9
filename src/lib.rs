pub mod breaker;
pub mod commands;
pub mod config;
pub mod detectors;
mod error;
pub mod heating;
pub mod learning;
pub mod plant;
pub mod rest;
pub mod schedule;
pub mod service;
pub mod states;
pub mod storage;
pub mod supervisor;
pub mod target;
pub mod timer;
mod types;
pub mod zone;

pub use breaker::{BreakerState, CircuitBreaker};
pub use commands::{BoilerDriver, CommandRecord, CommandStatus};
pub use config::{DaemonConfig, PlantConfig, ZoneConfig};
pub use error::{Error, Result};
pub use learning::{Regression, ThermalLearningEngine};
pub use plant::{Plant, PlantSnapshot};
pub use rest::{RestHost, RestHostBuilder};
pub use schedule::{CalendarDecision, ScheduleRequest};
pub use service::{ServiceBus, ServiceCall};
pub use states::{EntityState, StateSnapshot, StateSource};
pub use storage::{JsonFileStore, MemoryStore, Storage};
pub use supervisor::{BoilerSupervisor, SupervisorSnapshot};
pub use target::TargetMode;
pub use types::*;
pub use zone::{ZoneController, ZoneMode, ZoneSnapshot};
