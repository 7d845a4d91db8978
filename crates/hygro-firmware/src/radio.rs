//! esp-radio backed WiFi device

use esp_hal::peripherals::WIFI;
use esp_radio::wifi::{
    self, AuthMethod, ClientConfig, ModeConfig, PowerSaveMode, WifiController, WifiDevice,
    WifiError,
};
use hygro_core::net::{MacAddress, RadioConfig, RadioDevice, RadioFactory};
use log::{error, info, warn};
use smoltcp::phy::{Device, RxToken, TxToken};
use static_cell::StaticCell;
use thiserror_no_std::Error;

use crate::smol_now;

static RADIO_CONTROLLER: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("wifi driver error: {0:?}")]
    Wifi(WifiError),
    #[error("no transmit buffer free")]
    TxBusy,
}

impl From<WifiError> for RadioError {
    fn from(e: WifiError) -> Self {
        Self::Wifi(e)
    }
}

/// The station interface of the ESP32-S3 radio
pub struct EspRadio {
    controller: WifiController<'static>,
    device: WifiDevice<'static>,
}

impl RadioDevice for EspRadio {
    type Error = RadioError;

    async fn initialize(&mut self, config: &RadioConfig) -> Result<(), Self::Error> {
        let power_save = if config.power_save {
            PowerSaveMode::Minimum
        } else {
            PowerSaveMode::None
        };
        self.controller.set_power_saving(power_save)?;

        if !matches!(self.controller.is_started(), Ok(true)) {
            self.controller
                .set_config(&ModeConfig::Client(ClientConfig::default()))?;
            self.controller.start_async().await?;
        }
        Ok(())
    }

    fn hardware_address(&self) -> Result<MacAddress, Self::Error> {
        Ok(MacAddress(self.device.mac_address()))
    }

    async fn join_network(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::Wpa2Personal
        };
        let client = ClientConfig::default()
            .with_ssid(ssid.into())
            .with_password(password.into())
            .with_auth_method(auth_method);
        self.controller.set_config(&ModeConfig::Client(client))?;
        self.controller.connect_async().await?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.device.capabilities().max_transmission_unit
    }

    fn poll_one_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        let Some((rx, _tx)) = self.device.receive(smol_now()) else {
            return Ok(None);
        };
        let len = rx.consume(|frame| {
            if frame.len() > buf.len() {
                warn!("Dropping {} byte frame, buffer holds {}", frame.len(), buf.len());
                return 0;
            }
            buf[..frame.len()].copy_from_slice(frame);
            frame.len()
        });
        Ok((len > 0).then_some(len))
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        let tx = self.device.transmit(smol_now()).ok_or(RadioError::TxBusy)?;
        tx.consume(frame.len(), |buf| buf.copy_from_slice(frame));
        Ok(())
    }
}

/// Hands out the radio once. The WiFi peripheral is consumed by the driver,
/// so after a failed driver start every later call fails too.
pub struct EspRadioFactory {
    wifi: Option<WIFI<'static>>,
    controller: Option<&'static esp_radio::Controller<'static>>,
}

impl EspRadioFactory {
    pub fn new(wifi: WIFI<'static>) -> Self {
        Self {
            wifi: Some(wifi),
            controller: None,
        }
    }

    fn controller(&mut self) -> Option<&'static esp_radio::Controller<'static>> {
        if self.controller.is_none() {
            match esp_radio::init() {
                Ok(controller) => {
                    let controller: &'static _ = RADIO_CONTROLLER.init(controller);
                    self.controller = Some(controller);
                }
                Err(e) => {
                    error!("Radio controller initialization failed: {:?}", e);
                }
            }
        }
        self.controller
    }
}

impl RadioFactory for EspRadioFactory {
    type Radio = EspRadio;

    fn create(&mut self) -> Option<Self::Radio> {
        let controller = self.controller()?;
        let Some(peripheral) = self.wifi.take() else {
            error!("WiFi peripheral already handed to the driver");
            return None;
        };

        match wifi::new(controller, peripheral, Default::default()) {
            Ok((controller, interfaces)) => {
                info!("WiFi driver started");
                Some(EspRadio {
                    controller,
                    device: interfaces.sta,
                })
            }
            Err(e) => {
                error!("WiFi driver start failed: {:?}", e);
                None
            }
        }
    }
}
