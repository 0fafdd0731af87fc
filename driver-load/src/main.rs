use std::error::Error;
use std::process::ExitCode;

use driver_load::LoadConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let result = match LoadConfig::from_env() {
        Ok(config) => driver_load::run(&config).await,
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(report) => {
            println!("{report:#?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            let mut message = err.to_string();
            let mut source = err.source();
            while let Some(cause) = source {
                message.push_str(": ");
                message.push_str(&cause.to_string());
                source = cause.source();
            }
            tracing::error!("{message}");
            ExitCode::FAILURE
        }
    }
}
