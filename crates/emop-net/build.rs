//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Protobuf code generation for the mediator RPC surface."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to locate protoc");
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/mediator.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/mediator.proto"], &["proto"])
        .expect("failed to compile mediator gRPC definitions");
}
