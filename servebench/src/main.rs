fn main() -> anyhow::Result<()> {
    servebench::run()
}
