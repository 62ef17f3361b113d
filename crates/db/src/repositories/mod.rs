pub mod run_record_repo;

pub use run_record_repo::RunRecordRepo;
