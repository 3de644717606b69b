pub mod import_run;
pub mod job;
pub mod source;
