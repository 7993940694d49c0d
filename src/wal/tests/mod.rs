mod helpers;

mod tests_log;
mod tests_segment;
