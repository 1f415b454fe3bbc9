//! Attach a CDC serial device from a USBIPD server and poke it.
//!
//!     cargo run --example attach -- 10.0.0.2 1f46:1b01

use usbip_serial::{HardwareId, UsbipClient, USBIP_PORT};

fn parse_id(s: &str) -> Option<HardwareId> {
    let (vid, pid) = s.split_once(':')?;
    Some(HardwareId::new(
        u16::from_str_radix(vid, 16).ok()?,
        u16::from_str_radix(pid, 16).ok()?,
    ))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let id = args
        .next()
        .as_deref()
        .and_then(parse_id)
        .unwrap_or(HardwareId::new(0x1f46, 0x1b01));

    let mut client = UsbipClient::new(host, USBIP_PORT);
    client.connect_server().await?;

    let report = client.attach(&[id]).await?;
    for failure in &report.failed {
        eprintln!("{}: {}", failure.busid, failure.error);
    }

    for mut connection in client.get_connection(id) {
        connection.sendall(b"AT\r\n")?;
        match connection.response_data(0).await {
            Ok(reply) => println!(
                "{}: {}",
                connection.busid(),
                String::from_utf8_lossy(&reply).trim_end()
            ),
            Err(e) => eprintln!("{}: {}", connection.busid(), e),
        }
    }

    client.shutdown();
    Ok(())
}
