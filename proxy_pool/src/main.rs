fn main() -> anyhow::Result<()> {
    proxy_pool::run()
}
