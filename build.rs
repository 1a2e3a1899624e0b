//! Embeds git and build metadata reported by `/health`.
//!
//! When the source tree has no `.git` (container builds), the values can be
//! passed in as `VERGEN_GIT_SHA` / `VERGEN_BUILD_TIMESTAMP` instead.

use std::error::Error;
use vergen_gix::{Build, Emitter, Gix};

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-env-changed=VERGEN_GIT_SHA");
    if std::env::var("VERGEN_GIT_SHA").is_ok() {
        println!("cargo:warning=Using git metadata from environment variables");
        return Ok(());
    }

    let build = Build::all_build();
    let gix = Gix::all_git();
    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&gix)?
        .emit()?;
    Ok(())
}
