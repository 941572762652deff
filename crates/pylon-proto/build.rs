//! Build script for compiling protobuf definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let proto_files = ["proto/pylon/v1/cloudevent.proto"];
    let includes = ["proto"];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Use BTreeMap for deterministic attribute ordering
        .btree_map(["."])
        .compile_protos(&proto_files, &includes)?;

    // Rerun if proto files change
    for file in &proto_files {
        println!("cargo:rerun-if-changed={file}");
    }

    Ok(())
}
