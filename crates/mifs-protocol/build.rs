use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let proto_dir = manifest.join("proto");
    let proto_file = proto_dir.join("is2fs.proto");

    // Fall back to the bundled compiler when the host has none configured.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(std::slice::from_ref(&proto_file), &[proto_dir.as_path()])?;

    println!("cargo:rerun-if-changed={}", proto_file.display());
    Ok(())
}
