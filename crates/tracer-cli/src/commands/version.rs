use miette::Result;

pub fn run() -> Result<()> {
    println!("tracer {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
