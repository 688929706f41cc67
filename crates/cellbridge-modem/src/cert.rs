//! Certificate download to the modem's file system.

use cellbridge_uart::{Clock, SerialPort};
use log::{error, info};

use crate::commands::{is_quotable, AtCommand};
use crate::error::{SessionError, SessionResult};
use crate::responses::{OK, PROMPT};
use crate::session::{Session, SHORT_TIMEOUT_MS};

/// Bytes written per chunk of a certificate body.
pub const CERT_CHUNK_SIZE: usize = 512;

/// Pause between chunks so the modem can drain its UART.
pub const CERT_CHUNK_PACING_MS: u64 = 50;

/// How long the modem may take to store the file.
pub const CERT_STORE_TIMEOUT_MS: u64 = 5000;

impl<P: SerialPort, C: Clock> Session<P, C> {
    /// Store a PEM certificate on the modem under `name`.
    ///
    /// Can be called before [`Session::connect`]; a configured
    /// [`crate::MqttConfig::ca_cert`] then refers to it by name.
    pub fn upload_certificate(&mut self, name: &str, pem: &[u8]) -> SessionResult<()> {
        if name.is_empty() || !is_quotable(name) {
            return Err(SessionError::InvalidArgument(format!(
                "certificate name {:?} cannot be quoted",
                name
            )));
        }
        if pem.is_empty() {
            return Err(SessionError::InvalidArgument("certificate is empty".into()));
        }

        info!("Uploading certificate {} ({} bytes)", name, pem.len());
        let command = AtCommand::CertDownload {
            name: name.to_string(),
            len: pem.len(),
        };
        self.exchange(&command, PROMPT, SHORT_TIMEOUT_MS).map_err(|err| {
            error!("Certificate upload did not start: {}", err);
            err
        })?;

        self.channel.response_mut().clear();
        for chunk in pem.chunks(CERT_CHUNK_SIZE) {
            self.channel.write(chunk)?;
            self.channel.delay_ms(CERT_CHUNK_PACING_MS);
        }

        let stored = self.channel.wait_response(OK, CERT_STORE_TIMEOUT_MS);
        self.absorb_notifications();
        stored.map_err(|err| {
            error!("Certificate upload not confirmed: {}", err);
            err
        })?;
        info!("Certificate {} stored", name);
        Ok(())
    }
}
