pub mod artifacts;
pub mod browser;
pub mod config;
pub mod interpreter;
pub mod report;
pub mod server;
pub mod session;
pub mod step;

pub use browser::{Browser, BrowserConfig};
pub use config::RunnerConfig;
pub use interpreter::{Interpreter, InterpreterConfig, PageDriver, StepError};
pub use report::{RunReporter, RunResult, RunStatus, ShotStatus};
pub use session::{Executor, SessionLauncher};
pub use step::{Action, Locator, Step, StepKind};
