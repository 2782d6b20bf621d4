pub mod check;
pub mod hash;
pub mod run;
