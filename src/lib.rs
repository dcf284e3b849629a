// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Phone Orchestrator
//!
//! Multi-device task orchestration for AI-driven Android automation.
//!
//! Plans are DAGs of natural-language steps. The [`queue::TaskQueueManager`]
//! hands ready steps to one worker per device under exclusive device leases,
//! each worker drives an [`agent::AgentRunLoop`] (screenshot, decide, act)
//! until the step completes or runs out of budget, and the
//! [`schedule::Scheduler`] turns time rules into new plans.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use phone_orchestrator::adb::AdbClient;
//! use phone_orchestrator::decision::{DecisionRouter, LocalStepDecision};
//! use phone_orchestrator::model::{ModelClient, ModelConfig};
//! use phone_orchestrator::transport::AdbTransport;
//! use phone_orchestrator::{Orchestrator, OrchestratorOptions, PlanSpec, StepSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ModelClient::new(ModelConfig::default())?;
//!     let router = DecisionRouter::new(Arc::new(LocalStepDecision::new(client, "cn")));
//!     let transport = Arc::new(AdbTransport::new(AdbClient::new()));
//!
//!     let orchestrator = Orchestrator::new(transport, router, None, OrchestratorOptions::default())?;
//!     orchestrator.start(&["emulator-5554".to_string()])?;
//!
//!     let plan_id = orchestrator.submit_plan(
//!         PlanSpec::new("morning")
//!             .with_step(StepSpec::new("打开微信").with_id("wechat"))
//!             .with_step(StepSpec::new("查看未读消息").after("wechat")),
//!     )?;
//!     let snapshot = orchestrator.wait_plan(&plan_id, None).await?;
//!     println!("{:?}", snapshot.status);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod adb;
pub mod agent;
pub mod config;
pub mod decision;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod schedule;
pub mod settings;
pub mod store;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;

pub use agent::{AgentRunLoop, RunLoopConfig, StepExecutor};
pub use decision::{DecisionKind, DecisionRouter};
pub use orchestrator::{CancelReport, Orchestrator, OrchestratorError, OrchestratorOptions};
pub use queue::{PlanSnapshot, TaskQueueManager};
pub use schedule::{ScheduleRule, Scheduler, Trigger};
pub use settings::OrchestratorSettings;
pub use store::{JsonStore, MemoryStore, StateStore};
pub use task::{ExecutionRecord, HistoryFilter, PlanSpec, StepSpec};
pub use transport::{AdbTransport, DeviceTransport};
