fn main() -> anyhow::Result<()> {
    forkchan_cli::run()
}
