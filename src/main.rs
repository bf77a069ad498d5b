fn main() -> anyhow::Result<()> {
    vocab_sync::cli::run()
}
