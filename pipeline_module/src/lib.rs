pub mod elaborate;
pub mod html;
pub mod memory_queue;
pub mod notification;
pub mod service;
pub mod service_bus_queue;
pub mod task;
pub mod work_queue;
pub mod worker;
