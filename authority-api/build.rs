fn main() -> Result<(), anyhow::Error> {
    let mut proto_config = prost_build::Config::new();
    proto_config.bytes(["."]);
    let file_descriptors = protox::compile(
        ["proto/authority/delegated/v1/delegated.proto"],
        ["proto"],
    )?;
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds_with_config(proto_config, file_descriptors)?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
