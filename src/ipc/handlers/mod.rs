pub mod backup_exchange;
pub mod cash;
pub mod company;
pub mod core;
pub mod dashboard;
pub mod documents;
pub mod enrollments;
pub mod invoices;
pub mod payments;
pub mod programs;
pub mod reports;
pub mod settings;
pub mod students;
pub mod teachers;
pub mod users;
