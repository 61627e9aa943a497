pub mod health_handlers;
pub mod photo_handlers;
pub mod trigger_handlers;
pub mod upload_handlers;
