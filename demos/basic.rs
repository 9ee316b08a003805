use std::time::Duration;

use onerng::{CancelToken, NoiseMode, OneRng};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::var("ONERNG_DEVICE").unwrap_or_else(|_| "/dev/ttyACM0".into());
    let mut rng = OneRng::new(path.as_str());
    let token = CancelToken::new();

    // Device info
    println!("Version: {}", rng.version(&token)?);
    println!("ID:      {}", rng.identify(&token)?);

    rng.init(&token)?;

    // Default mode: avalanche diode with the CRC16 whitener
    let mut buf = Vec::new();
    rng.read(&token, &mut buf, Some(32), NoiseMode::DEFAULT)?;
    println!("\nDefault:    {}", hex::encode(&buf));

    // Raw avalanche output
    let raw = NoiseMode {
        disable_whitener: true,
        ..NoiseMode::DEFAULT
    };
    buf.clear();
    rng.read(&token, &mut buf, Some(32), raw)?;
    println!("Raw:        {}", hex::encode(&buf));

    // AES-whitened stream, keyed from the device
    let mut whitener = rng.aes_whitener(&token, Vec::new())?;
    rng.read(&token, &mut whitener, Some(32), NoiseMode::DEFAULT)?;
    println!("AES:        {}", hex::encode(whitener.get_ref()));

    // Stream for one second
    let timed = token.child_with_timeout(Duration::from_secs(1));
    let mut sink = std::io::sink();
    match rng.read(&timed, &mut sink, None, NoiseMode::DEFAULT) {
        Ok(n) => println!("\nStream ended after {n} bytes"),
        Err(e) if e.source.is_cancellation() => println!("\n{} bytes in 1s", e.written),
        Err(e) => return Err(e.into()),
    }

    rng.flush(&token)?;
    Ok(())
}
