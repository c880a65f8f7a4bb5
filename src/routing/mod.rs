pub mod annotations;
pub mod history;
pub mod queue;
pub mod router;
