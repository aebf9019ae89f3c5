use cdx_index_engine::cli::{self, Cli};
use cdx_index_engine::error::CdxError;
use clap::Parser;

fn main() {
    cdx_index_engine::logging::init();

    let cli = Cli::parse();
    if let Err(err) = cli::run(cli) {
        eprintln!("error: {err:#}");
        let code = err
            .downcast_ref::<CdxError>()
            .map(CdxError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
