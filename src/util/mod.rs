pub mod buf_ext;
pub mod julian_date;
