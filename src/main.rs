use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cfg = pikey::config::Config::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            if cfg.wipe {
                pikey::wipe(cfg).await
            } else {
                pikey::run(cfg).await
            }
        })
}
