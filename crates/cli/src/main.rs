//! `sysc`: the system-containers command-line front end. Thin wrapper that
//! delegates to [`sysc_lib::cli::run`].

fn main() {
    sysc_lib::logging::init();
    sysc_lib::logging::run_main(sysc_lib::cli::run);
}
