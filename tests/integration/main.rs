//! Integration tests: whole stages assembled and run through the public
//! API, including the failure and cancellation paths.

mod test_panic_propagation;
mod test_stage_run;

/// Initialize logging for a test. Safe to call from every test; only the
/// first call in the process wins.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
