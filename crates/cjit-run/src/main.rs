//! Demo driver for the import/sym/free module API.
//!
//! The real C frontend is an external collaborator this workspace doesn't
//! ship; this binary runs [`cjit::TestFrontend`] instead, so it only proves
//! out the import/cache/symbol-lookup plumbing, not actual C compilation.

use cjit::TestFrontend;

fn main() {
    env_logger::init();

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: cjit-run <source.c>");
            std::process::exit(1);
        }
    };

    let handle = match cjit::import::<TestFrontend>(&path) {
        Ok(h) => h,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    match handle.sym("main") {
        Ok(addr) => {
            log::info!("resolved 'main' at {addr:#x} (state: {:?})", handle.state());
            handle.free();
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}
