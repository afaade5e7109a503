fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/kasho.proto");
    tonic_build::compile_protos("proto/kasho.proto")?;
    Ok(())
}
