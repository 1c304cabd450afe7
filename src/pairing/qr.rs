//! QR payload rendering: PNG data URLs for chat/API callers and
//! terminal-friendly text for the CLI.

use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, QrCode};
use std::io::Cursor;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

pub trait QrRenderer: Send + Sync {
    /// Render `payload` to a base64-encoded PNG (no data URL prefix).
    fn render(&self, payload: &str) -> Result<String>;
}

/// Wrap base64 PNG bytes as an inline image URL.
pub fn to_data_url(base64_png: &str) -> String {
    format!("{DATA_URL_PREFIX}{base64_png}")
}

#[derive(Debug, Clone, Copy)]
pub struct PngQrRenderer {
    /// Pixels per QR module.
    pub module_px: u32,
    /// Light modules around the code.
    pub quiet_zone: u32,
}

impl Default for PngQrRenderer {
    fn default() -> Self {
        Self {
            module_px: 6,
            quiet_zone: 4,
        }
    }
}

impl QrRenderer for PngQrRenderer {
    fn render(&self, payload: &str) -> Result<String> {
        let code = encode(payload)?;
        let width = u32::try_from(code.width()).map_err(|_| anyhow!("QR code too large"))?;
        let colors = code.to_colors();
        let module_px = self.module_px.max(1);
        let side = (width + 2 * self.quiet_zone) * module_px;

        let image = GrayImage::from_fn(side, side, |x, y| {
            let mx = (x / module_px).checked_sub(self.quiet_zone);
            let my = (y / module_px).checked_sub(self.quiet_zone);
            let dark = match (mx, my) {
                (Some(mx), Some(my)) if mx < width && my < width => {
                    colors[(my * width + mx) as usize] == Color::Dark
                }
                _ => false,
            };
            Luma([if dark { 0 } else { 255 }])
        });

        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|err| anyhow!("Failed to encode QR PNG: {err}"))?;
        Ok(STANDARD.encode(png))
    }
}

/// Render a pairing QR payload into terminal-friendly text.
pub fn render_terminal(payload: &str) -> Result<String> {
    let code = encode(payload)?;
    Ok(code
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

fn encode(payload: &str) -> Result<QrCode> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }
    QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode WhatsApp Web QR payload: {err}"))
}
