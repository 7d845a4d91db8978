#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Instant, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::rng::Rng;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info, warn};
use static_cell::StaticCell;

use hygro_core::config::{Config, InternetConfig, RetryTiming};
use hygro_core::net::{BringUp, HttpClient, NetworkContext, PacketPump, PumpLauncher};
use hygro_firmware::radio::{EspRadio, EspRadioFactory};
use hygro_firmware::smol_stack::{SmolStack, SmolStackFactory};
use hygro_firmware::wifi_secrets::{HTTP_PROBE_URL, WIFI_HOSTNAME, WIFI_PASSWORD, WIFI_SSID};

const STAGE_LOG_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_secs(60);

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static NETWORK: StaticCell<NetworkContext<SmolStack>> = StaticCell::new();

type FirmwareBringUp = BringUp<'static, EspRadioFactory, SmolStackFactory, SpawnPump, Delay>;
type FirmwarePump = PacketPump<'static, SmolStack, EspRadio, Delay>;

#[embassy_executor::task]
async fn bring_up_task(bring_up: FirmwareBringUp) {
    bring_up.run().await;
}

#[embassy_executor::task]
async fn packet_pump_task(pump: FirmwarePump) -> ! {
    pump.run().await
}

/// Starts the packet pump task once the bring-up hands over the radio
struct SpawnPump {
    spawner: Spawner,
    timing: RetryTiming,
}

impl PumpLauncher<'static, SmolStack, EspRadio> for SpawnPump {
    fn launch(&mut self, ctx: &'static NetworkContext<SmolStack>, radio: EspRadio) {
        let pump = PacketPump::new(ctx, radio, Delay, &self.timing);
        match packet_pump_task(pump) {
            Ok(token) => self.spawner.spawn(token),
            Err(e) => error!("Failed to spawn packet pump: {:?}", e),
        }
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!(log::LevelFilter::Info);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    let config = Config {
        internet: InternetConfig {
            ssid: WIFI_SSID,
            password: WIFI_PASSWORD,
            hostname: WIFI_HOSTNAME,
        },
        timing: RetryTiming::default(),
    };

    let network: &'static NetworkContext<SmolStack> = NETWORK.init(NetworkContext::new());

    let bring_up = BringUp::new(
        network,
        &config,
        EspRadioFactory::new(peripherals.WIFI),
        SmolStackFactory,
        SpawnPump {
            spawner,
            timing: config.timing,
        },
        Delay,
    );
    match bring_up_task(bring_up) {
        Ok(token) => spawner.spawn(token),
        Err(e) => error!("Failed to spawn network bring-up: {:?}", e),
    }

    let rng = Rng::new();
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
    let mut http = HttpClient::new(network, Delay, config.timing, seed);

    loop {
        let stage = network.stage();
        if !stage.is_ready() {
            info!("Network stage: {}", stage);
            Timer::after(STAGE_LOG_INTERVAL).await;
            continue;
        }

        let started = Instant::now();
        match http.get(HTTP_PROBE_URL).await {
            Ok(response) if response.is_success() => info!(
                "GET {}: {} {} {}, content length {}, {} body bytes in {}ms",
                HTTP_PROBE_URL,
                response.protocol,
                response.status_code,
                response.status,
                response.content_length,
                response.body.len(),
                started.elapsed().as_millis()
            ),
            Ok(response) => warn!("GET {}: {}", HTTP_PROBE_URL, response.status_line),
            Err(e) => error!("GET {} failed: {}", HTTP_PROBE_URL, e),
        }
        Timer::after(PROBE_INTERVAL).await;
    }
}
