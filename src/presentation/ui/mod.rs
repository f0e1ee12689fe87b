pub mod display;
pub mod progress_board;
