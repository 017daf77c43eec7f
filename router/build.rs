use std::env;
use std::error::Error;
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-env-changed=GIT_SHA");

    // Builds from a source archive have no repository to read the short sha from
    let emitted = EmitBuilder::builder().fail_on_error().git_sha(true).emit();
    if emitted.is_err() {
        if let Ok(sha) = env::var("GIT_SHA") {
            println!("cargo:rustc-env=VERGEN_GIT_SHA={sha}");
        }
    }

    Ok(())
}
