pub use super::document_files::Entity as DocumentFiles;
