fn main() {
    let protos = [
        ("p4runtime/proto", "p4/v1/p4runtime.proto"),
        ("p4runtime/proto", "p4/config/v1/p4info.proto"),
        ("googleapis", "google/rpc/status.proto"),
    ];
    for proto in &protos {
        println!("cargo:rerun-if-changed={}/{}", proto.0, proto.1);
    }

    // Build with the vendored protoc, which also carries google/protobuf/*.proto.
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("No vendored protoc for this host!");
    std::env::set_var("PROTOC", protoc);
    let mut includes: Vec<std::path::PathBuf> = protos.iter().map(|x| x.0.into()).collect();
    includes.push(protoc_bin_vendored::include_path().expect("No vendored protobuf includes!"));

    tonic_build::configure()
        .build_server(false)
        .compile(
            &protos.iter().map(|x| format!("{}/{}", x.0, x.1)).collect::<Vec<String>>(),
            &includes,
        )
        .expect("Failed to compile gRPC definitions!");
}
