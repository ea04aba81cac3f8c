//! Pairing aid: the setup URI hubs accept in place of typing the PIN.

use std::path::Path;

use qrcode::render::svg;
use qrcode::EcLevel;
use qrcode::QrCode;
use tracing::info;
use tracing::warn;

use super::AccessoryKind;

const SETUP_URI_SCHEME: &str = "X-HM://";
const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Transport flag for accessories reachable over IP
const FLAG_IP: u64 = 2;

const SETUP_CODE_MASK: u64 = 0x7ff_ffff;

/// Files written into the device storage directory
pub const PAIRING_AID_FILE: &str = "setup-uri.txt";
pub const PAIRING_QR_FILE: &str = "setup-qr.svg";

const QR_SIZE: u32 = 256;

/// Four character setup id, stable for a given device name.
pub fn setup_id(name: &str) -> String {
    // FNV-1a, folded into four base36 digits
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let mut id = base36(hash % 36u64.pow(4));
    while id.len() < 4 {
        id.insert(0, '0');
    }
    id
}

/// Setup URI for an accessory. `pin` is the eight digit pairing code.
pub fn setup_uri(kind: AccessoryKind, pin: &str, setup_id: &str) -> String {
    let code = pin.parse::<u64>().unwrap_or(0) & SETUP_CODE_MASK;
    let payload = (u64::from(kind.category()) << 31) | (FLAG_IP << 27) | code;

    let mut encoded = base36(payload);
    while encoded.len() < 9 {
        encoded.insert(0, '0');
    }
    format!("{}{}{}", SETUP_URI_SCHEME, encoded, setup_id)
}

fn base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Scannable QR code of the setup URI, as an SVG document
pub fn render_qr(uri: &str) -> Result<String, qrcode::types::QrError> {
    let code = QrCode::with_error_correction_level(uri, EcLevel::M)?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(QR_SIZE, QR_SIZE)
        .build())
}

/// Log the setup URI and, when the device has storage, write it there
/// along with its QR code.
///
/// Failures are logged only; pairing works without the aid.
pub async fn render_pairing_aid(name: &str, uri: &str, storage_path: Option<&Path>) {
    info!("Pairing {} with setup URI {}", name, uri);

    let Some(dir) = storage_path else {
        return;
    };
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("Could not create storage directory {}: {}", dir.display(), e);
        return;
    }
    let path = dir.join(PAIRING_AID_FILE);
    if let Err(e) = tokio::fs::write(&path, format!("{}\n", uri)).await {
        warn!("Could not write pairing aid {}: {}", path.display(), e);
    }

    let qr = match render_qr(uri) {
        Ok(qr) => qr,
        Err(e) => {
            warn!("Could not render QR code for {}: {}", name, e);
            return;
        }
    };
    let path = dir.join(PAIRING_QR_FILE);
    if let Err(e) = tokio::fs::write(&path, qr).await {
        warn!("Could not write pairing QR code {}: {}", path.display(), e);
    }
}
