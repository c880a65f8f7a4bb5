fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so the build has no system dependency.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/switchboard.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/switchboard.proto");
    Ok(())
}
