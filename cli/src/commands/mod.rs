pub mod calibrate;
pub mod config;
pub mod export;
pub mod replay;
pub mod rules;

pub use calibrate::CalibrateArgs;
pub use config::ConfigArgs;
pub use export::ExportArgs;
pub use replay::ReplayArgs;
pub use rules::RulesArgs;
