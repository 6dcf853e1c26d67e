pub mod assignment;
pub mod audit;
pub mod booking;
pub mod driver;
pub mod retry_task;
