use std::env;
use std::io::Result;
use std::path::PathBuf;

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    tonic_prost_build::configure()
        .file_descriptor_set_path(out_dir.join("orchestrator_descriptor.bin"))
        .compile_protos(&["proto/orchestrator.proto"], &["proto/"])?;
    Ok(())
}
