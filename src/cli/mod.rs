pub mod analyze;
pub mod batches;
pub mod inspect;
pub mod run;
pub mod top;
