fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protox compiles the descriptors in-process so the build does not
    // depend on a system protoc
    let descriptors = protox::compile(["proto/api.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(descriptors)?;
    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}
