pub mod document_store;
pub mod mimetype;
pub mod pipeline;
pub mod processor;
pub mod thumbnail_service;
pub mod upload;
pub mod worker;
