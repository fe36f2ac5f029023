pub mod object_gateway;
pub mod refresh_scheduler;
pub mod resource_service;
pub mod resource_store;
#[cfg(test)]
pub mod testing;
pub mod url_lifecycle;
