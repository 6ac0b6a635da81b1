pub mod bootstrap;
pub mod logging;
pub mod rabbit;
/// Error Reporting Fabric shared by all pipeline stages.
pub mod report;
pub mod stop;
