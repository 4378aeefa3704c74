use std::error::Error;

use samsa_delivery::prelude::{ClientConfig, ConsumerConfig, ProducerConfig};

fn main() -> Result<(), Box<dyn Error>> {
    // Load environment variables from .env file.
    // Fails if .env file not found, not readable or invalid.
    dotenvy::dotenv()?;

    println!("{:#?}", ClientConfig::from_env()?);
    println!("{:#?}", ProducerConfig::from_env()?);
    match ConsumerConfig::from_env() {
        Ok(config) => println!("{:#?}", config),
        Err(err) => println!("No consumer configured: {}", err),
    }

    Ok(())
}
