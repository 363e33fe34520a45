pub mod eventmodel;
pub mod referralmodel;
pub mod usermodel;
