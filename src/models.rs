pub mod campaigns;
pub mod users;
pub mod verification;
