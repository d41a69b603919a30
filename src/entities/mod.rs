pub mod prelude;

pub mod document_files;
