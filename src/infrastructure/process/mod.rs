//! Process engine infrastructure: the engine, its runtime and adapters

mod engine;
#[cfg(test)]
mod engine_tests;
mod in_memory_repository;
mod notifier;
mod resolver;
mod runtime;
mod script;
mod timer;
mod variable_store;

pub use engine::ProcessEngine;
pub use in_memory_repository::{InMemoryProcessRepository, InMemoryTemplateRepository};
pub use notifier::{TracingNotifier, WebhookNotifier};
pub use resolver::ExpressionParticipantResolver;
pub use runtime::{DeadLetter, ProcessRuntime, RuntimeConfig};
pub use script::CommandScriptExecutor;
pub use timer::TimerScanner;
pub use variable_store::VariableStore;
