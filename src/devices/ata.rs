//! ATA PIO driver for the raw swap disk: 512-byte sector reads and writes,
//! nothing more. The swap device is the second device on the secondary
//! channel (the "1,1" disk).

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

pub const SECTOR_SIZE: usize = 512;

// ── ATA PIO port offsets (relative to io_base) ────────────────

const DATA_REG: u16 = 0;
const ERROR_REG: u16 = 1;
const SECTOR_COUNT: u16 = 2;
const LBA_LOW: u16 = 3;
const LBA_MID: u16 = 4;
const LBA_HIGH: u16 = 5;
const DRIVE_HEAD: u16 = 6;
const CMD_STATUS: u16 = 7;

// Status register bits
const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;
const STATUS_DF: u8 = 0x20;

// ATA commands
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;

#[derive(Debug, Clone, Copy)]
pub enum AtaError {
    DeviceNotFound,
    DeviceFault,
    BusyTimeout,
    DrqTimeout,
}

impl fmt::Display for AtaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AtaError::DeviceNotFound => write!(f, "Device not found"),
            AtaError::DeviceFault => write!(f, "Device fault"),
            AtaError::BusyTimeout => write!(f, "BSY timeout"),
            AtaError::DrqTimeout => write!(f, "DRQ timeout"),
        }
    }
}

pub type AtaResult<T> = Result<T, AtaError>;

pub struct AtaDevice {
    io_base: u16,
    ctrl_base: u16,
    is_master: bool,
    detected: bool,
    sectors: u32,
}

impl AtaDevice {
    pub const fn new(io_base: u16, ctrl_base: u16, is_master: bool) -> Self {
        AtaDevice {
            io_base,
            ctrl_base,
            is_master,
            detected: false,
            sectors: 0,
        }
    }

    // ── Port I/O helpers ─────────────────────────────────────

    fn read_port(&self, offset: u16) -> u8 {
        let mut port = Port::<u8>::new(self.io_base + offset);
        unsafe { port.read() }
    }

    fn write_port(&self, offset: u16, val: u8) {
        let mut port = Port::<u8>::new(self.io_base + offset);
        unsafe { port.write(val) }
    }

    fn read_data16(&self) -> u16 {
        let mut port = Port::<u16>::new(self.io_base + DATA_REG);
        unsafe { port.read() }
    }

    fn write_data16(&self, val: u16) {
        let mut port = Port::<u16>::new(self.io_base + DATA_REG);
        unsafe { port.write(val) }
    }

    fn read_ctrl(&self) -> u8 {
        let mut port = Port::<u8>::new(self.ctrl_base);
        unsafe { port.read() }
    }

    // ── Status polling ───────────────────────────────────────

    fn wait_bsy(&self) -> AtaResult<()> {
        for _ in 0..100_000 {
            let status = self.read_port(CMD_STATUS);
            if status & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AtaError::BusyTimeout)
    }

    fn wait_drq(&self) -> AtaResult<()> {
        for _ in 0..100_000 {
            let status = self.read_port(CMD_STATUS);
            if status & STATUS_ERR != 0 || status & STATUS_DF != 0 {
                return Err(AtaError::DeviceFault);
            }
            if status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AtaError::DrqTimeout)
    }

    /// 400ns settle delay: four reads of the alternate status register.
    fn delay_400ns(&self) {
        for _ in 0..4 {
            let _ = self.read_ctrl();
        }
    }

    fn select_drive(&self) {
        let val = if self.is_master { 0xA0 } else { 0xB0 };
        self.write_port(DRIVE_HEAD, val);
        self.delay_400ns();
    }

    // ── IDENTIFY ─────────────────────────────────────────────

    /// Identify the disk, capturing its LBA28 capacity.
    pub fn identify(&mut self) -> AtaResult<()> {
        self.select_drive();
        self.write_port(SECTOR_COUNT, 0);
        self.write_port(LBA_LOW, 0);
        self.write_port(LBA_MID, 0);
        self.write_port(LBA_HIGH, 0);
        self.write_port(CMD_STATUS, CMD_IDENTIFY);

        let status = self.read_port(CMD_STATUS);
        if status == 0 {
            return Err(AtaError::DeviceNotFound);
        }

        self.wait_bsy()?;

        // Non-zero LBA mid/high means the device is not ATA.
        let mid = self.read_port(LBA_MID);
        let high = self.read_port(LBA_HIGH);
        if mid != 0 || high != 0 {
            return Err(AtaError::DeviceNotFound);
        }

        self.wait_drq()?;

        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            *word = self.read_data16();
        }
        // Words 60-61: total addressable LBA28 sectors.
        self.sectors = identify[60] as u32 | ((identify[61] as u32) << 16);

        self.detected = true;
        Ok(())
    }

    pub fn sector_count(&self) -> u32 {
        self.sectors
    }

    // ── READ / WRITE SECTOR (LBA28) ──────────────────────────

    fn setup_transfer(&self, lba: u32) -> AtaResult<()> {
        self.wait_bsy()?;
        let head = if self.is_master { 0xE0 } else { 0xF0 };
        self.write_port(DRIVE_HEAD, head | ((lba >> 24) as u8 & 0x0F));
        self.delay_400ns();
        self.write_port(ERROR_REG, 0);
        self.write_port(SECTOR_COUNT, 1);
        self.write_port(LBA_LOW, lba as u8);
        self.write_port(LBA_MID, (lba >> 8) as u8);
        self.write_port(LBA_HIGH, (lba >> 16) as u8);
        Ok(())
    }

    /// Read one 512-byte sector at the given LBA.
    pub fn read_sector(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> AtaResult<()> {
        if !self.detected {
            return Err(AtaError::DeviceNotFound);
        }
        self.setup_transfer(lba)?;
        self.write_port(CMD_STATUS, CMD_READ_SECTORS);
        self.wait_drq()?;

        for i in 0..256 {
            let word = self.read_data16();
            buf[i * 2] = (word & 0xFF) as u8;
            buf[i * 2 + 1] = (word >> 8) as u8;
        }
        Ok(())
    }

    /// Write one 512-byte sector at the given LBA.
    pub fn write_sector(&self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> AtaResult<()> {
        if !self.detected {
            return Err(AtaError::DeviceNotFound);
        }
        self.setup_transfer(lba)?;
        self.write_port(CMD_STATUS, CMD_WRITE_SECTORS);
        self.wait_drq()?;

        for i in 0..256 {
            let word = (buf[i * 2] as u16) | ((buf[i * 2 + 1] as u16) << 8);
            self.write_data16(word);
        }

        self.write_port(CMD_STATUS, CMD_CACHE_FLUSH);
        self.wait_bsy()?;
        Ok(())
    }
}

lazy_static! {
    /// The raw swap disk: secondary channel, second device.
    pub static ref SWAP_DISK: Mutex<AtaDevice> = Mutex::new(AtaDevice::new(0x170, 0x376, false));
}

pub fn init() {
    let mut disk = SWAP_DISK.lock();
    match disk.identify() {
        Ok(()) => crate::log_info!("ata: swap disk, {} sectors", disk.sector_count()),
        Err(e) => crate::log_warn!("ata: no swap disk ({})", e),
    }
}
