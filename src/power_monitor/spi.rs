//! MCP3008 sample source over the Linux spidev interface.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use chrono::Utc;
use nix::{ioctl_write_buf, ioctl_write_ptr};

use super::config::MonitorConfig;
use super::error::MonitorError;
use super::source::SampleSource;
use super::types::{ChannelId, SampleBatch};

/* spidev IOCTL */
const SPI_IOC_MAGIC: u8 = b'k';
const SPI_IOC_NR_MESSAGE: u8 = 0;
const SPI_IOC_NR_MODE: u8 = 1;
const SPI_IOC_NR_BITS_PER_WORD: u8 = 3;
const SPI_IOC_NR_MAX_SPEED_HZ: u8 = 4;

ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, SPI_IOC_NR_MESSAGE, SpiIocTransfer);
ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, SPI_IOC_NR_MODE, u8);
ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, SPI_IOC_NR_BITS_PER_WORD, u8);
ioctl_write_ptr!(spi_write_max_speed_hz, SPI_IOC_MAGIC, SPI_IOC_NR_MAX_SPEED_HZ, u32);

/* Board voltage is averaged over this many reads. */
const BOARD_VOLTAGE_READS: usize = 11;

/* Current channels in the order they are read; the voltage sits in the middle. */
const INTERLEAVE: [u8; 6] = [1, 5, 2, 3, 4, 6];

/// Kernel `struct spi_ioc_transfer`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadSlot {
    Current(ChannelId, u8),
    Voltage(u8),
}

pub struct Mcp3008Source {
    device: File,
    speed_hz: u32,
    resolution: u32,
    read_order: Vec<ReadSlot>,
    board_voltage_channel: u8,
    reference_voltage: f64,
    board_voltage_divider: f64,
}

fn read_order(config: &MonitorConfig) -> Vec<ReadSlot> {
    let currents: Vec<ReadSlot> = INTERLEAVE
        .iter()
        .filter_map(|&n| ChannelId::new(n).ok())
        .filter_map(|channel| {
            config
                .channels
                .get(&channel)
                .map(|cfg| ReadSlot::Current(channel, cfg.adc_channel))
        })
        .collect();

    let half = (currents.len() + 1) / 2;
    let mut order = Vec::with_capacity(currents.len() + 1);
    order.extend_from_slice(&currents[..half]);
    order.push(ReadSlot::Voltage(config.adc.voltage_channel));
    order.extend_from_slice(&currents[half..]);
    order
}

impl Mcp3008Source {
    /*
    * @brief Open and configure the spidev device named in the configuration.
    * @return Source reading every configured channel plus the voltage input.
    * @note SPI mode 0, 8 bits per word; the phase coefficients depend on the bus speed.
    */
    pub fn open(config: &MonitorConfig) -> Result<Self, MonitorError> {
        let device = OpenOptions::new().read(true).write(true).open(&config.adc.device)?;
        let fd = device.as_raw_fd();

        let mode: u8 = 0;
        let bits: u8 = 8;
        let speed = config.adc.max_speed_hz;
        unsafe {
            spi_write_mode(fd, &mode)?;
            spi_write_bits_per_word(fd, &bits)?;
            spi_write_max_speed_hz(fd, &speed)?;
        }

        log::info!(
            "Opened {} at {} kHz",
            config.adc.device.display(),
            f64::from(speed) / 1000.0
        );

        Ok(Mcp3008Source {
            device,
            speed_hz: speed,
            resolution: config.adc_resolution,
            read_order: read_order(config),
            board_voltage_channel: config.adc.board_voltage_channel,
            reference_voltage: config.adc.reference_voltage,
            board_voltage_divider: config.adc.board_voltage_divider,
        })
    }

    /// Single-ended conversion of one input.
    pub fn read_code(&mut self, pin: u8) -> Result<u16, MonitorError> {
        let tx: [u8; 3] = [1, (8 + pin) << 4, 0];
        let mut rx = [0u8; 3];

        let transfer = [SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            ..Default::default()
        }];
        unsafe {
            spi_message(self.device.as_raw_fd(), &transfer)?;
        }

        Ok((u16::from(rx[1] & 3) << 8) | u16::from(rx[2]))
    }
}

impl SampleSource for Mcp3008Source {
    fn acquire(&mut self, num_samples: usize) -> Result<SampleBatch, MonitorError> {
        let captured_at = Utc::now();
        let mut voltage = Vec::with_capacity(num_samples);
        let mut currents: BTreeMap<ChannelId, Vec<u16>> = self
            .read_order
            .iter()
            .filter_map(|slot| match slot {
                ReadSlot::Current(channel, _) => Some((*channel, Vec::with_capacity(num_samples))),
                ReadSlot::Voltage(_) => None,
            })
            .collect();

        let order = self.read_order.clone();
        for _ in 0..num_samples {
            for slot in &order {
                match *slot {
                    ReadSlot::Voltage(pin) => voltage.push(self.read_code(pin)?),
                    ReadSlot::Current(channel, pin) => {
                        let code = self.read_code(pin)?;
                        if let Some(codes) = currents.get_mut(&channel) {
                            codes.push(code);
                        }
                    }
                }
            }
        }

        Ok(SampleBatch {
            captured_at,
            voltage,
            currents,
        })
    }

    fn board_voltage(&mut self) -> Result<f64, MonitorError> {
        let mut total = 0.0;
        for _ in 0..BOARD_VOLTAGE_READS {
            total += f64::from(self.read_code(self.board_voltage_channel)?);
        }
        let average = total / BOARD_VOLTAGE_READS as f64;
        Ok(average / f64::from(self.resolution) * self.reference_voltage * self.board_voltage_divider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<SpiIocTransfer>(), 32);
    }

    #[test]
    fn voltage_is_read_between_the_current_channels() {
        let order = read_order(&MonitorConfig::default());
        let ct = |n| ChannelId::new(n).unwrap();
        assert_eq!(
            order,
            vec![
                ReadSlot::Current(ct(1), 0),
                ReadSlot::Current(ct(5), 6),
                ReadSlot::Current(ct(2), 1),
                ReadSlot::Voltage(5),
                ReadSlot::Current(ct(3), 2),
                ReadSlot::Current(ct(4), 3),
                ReadSlot::Current(ct(6), 7),
            ]
        );
    }

    #[test]
    fn unconfigured_channels_are_not_read() {
        let mut config = MonitorConfig::default();
        config.channels.retain(|channel, _| channel.number() <= 2);
        let order = read_order(&config);
        assert_eq!(order.len(), 3);
        assert_eq!(order[1], ReadSlot::Voltage(5));
    }
}
