pub mod intake;
pub mod object_store;
pub mod photo_repository;
pub mod queue;
pub mod transform;
pub mod worker;
