//! ACPI table parser
//!
//! Consumes the RSDP left by the loader, validates each table's checksum
//! (all bytes sum to zero modulo 256), and pulls out what the kernel
//! actually uses: the MADT (processor, I/O APIC, interrupt override, NMI
//! and address-override entries) and the FADT (century support, SCI
//! interrupt). Tables are touched through the transient window; nothing
//! here keeps a mapping.

use alloc::vec::Vec;

use crate::bugcheck::Reason;
use crate::error::{KernelError, KernelResult};
use crate::mm::window::MapView;
use crate::mm::{PhysicalAddress, PAGE_MASK, PAGE_SIZE};

const SDT_HEADER_SIZE: usize = 36;

const SIG_RSDT: u32 = u32::from_le_bytes(*b"RSDT");
const SIG_XSDT: u32 = u32::from_le_bytes(*b"XSDT");
const SIG_MADT: u32 = u32::from_le_bytes(*b"APIC");
const SIG_FADT: u32 = u32::from_le_bytes(*b"FACP");

// MADT entry types
const MADT_LOCAL_APIC: u8 = 0;
const MADT_IO_APIC: u8 = 1;
const MADT_SOURCE_OVERRIDE: u8 = 2;
const MADT_NMI_SOURCE: u8 = 3;
const MADT_LAPIC_NMI: u8 = 4;
const MADT_LAPIC_ADDR_OVERRIDE: u8 = 5;

/// A usable processor from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct Processor {
    pub uid: u8,
    pub apic_id: u8,
}

/// An interrupt routing override (ISA IRQ or NMI source -> GSI).
#[derive(Debug, Clone, Copy)]
pub struct Redirect {
    pub gsi: u32,
    pub irq: u8,
    /// Polarity/trigger flags as delivered by firmware.
    pub mode: u8,
}

/// A local-APIC NMI pin assignment.
#[derive(Debug, Clone, Copy)]
pub struct NmiPin {
    pub uid: u8,
    pub pin: u8,
    pub mode: u8,
}

/// Parsed MADT content.
#[derive(Debug, Default)]
pub struct Madt {
    pub local_apic_base: u64,
    pub pic_present: bool,
    pub io_apic_base: u64,
    pub gsi_base: u32,
    pub processors: Vec<Processor>,
    pub redirects: Vec<Redirect>,
    pub nmi_pins: Vec<NmiPin>,
}

/// Parsed FADT content.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fadt {
    pub sci_interrupt: u16,
    pub century: bool,
    pub power_profile: u8,
}

/// Everything the kernel keeps from firmware.
#[derive(Debug, Default)]
pub struct Acpi {
    pub madt: Option<Madt>,
    pub fadt: Option<Fadt>,
}

/// A table mapped through the transient window, clamped to one page (the
/// loader-placed tables the core consumes fit well within one).
struct TableView {
    _view: MapView,
    data: *const u8,
    limit: usize,
}

impl TableView {
    fn map(pa: u64) -> TableView {
        let aligned = pa & !PAGE_MASK;
        let offset = (pa - aligned) as usize;
        let view = MapView::new(PhysicalAddress::new(aligned));
        let data = unsafe { view.as_mut_ptr::<u8>().add(offset) as *const u8 };
        TableView {
            _view: view,
            data,
            limit: PAGE_SIZE - offset,
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the window slot pins the mapping; limit never crosses
        // the page boundary.
        unsafe { core::slice::from_raw_parts(self.data, self.limit) }
    }
}

/// Checksum over the table's declared length: bytes sum to zero mod 256.
fn validate(bytes: &[u8]) -> bool {
    if bytes.len() < 8 {
        return false;
    }
    let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if size < SDT_HEADER_SIZE || size > bytes.len() {
        return false;
    }
    bytes[..size]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
        == 0
}

impl Acpi {
    /// Walk the RSDP -> (R|X)SDT -> table chain. A missing or corrupt root
    /// is a hardware fault; individual broken tables are skipped.
    pub fn parse(rsdp: PhysicalAddress) -> KernelResult<Acpi> {
        // The RSDP word carries the table address in its low 56 bits and
        // the revision-derived kind in the top byte (0 = RSDT, else XSDT).
        let raw = rsdp.as_u64();
        let address = raw & 0x00FF_FFFF_FFFF_FFFF;
        let wide = (raw >> 56) != 0;
        if address == 0 {
            return Err(KernelError::FirmwareFault { table: "RSDP" });
        }
        let root = TableView::map(address);
        let bytes = root.bytes();
        if !validate(bytes) {
            return Err(KernelError::FirmwareFault { table: "RSDT" });
        }
        let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let stride = if wide { 8 } else { 4 };
        if signature != if wide { SIG_XSDT } else { SIG_RSDT }
            || (size - SDT_HEADER_SIZE) % stride != 0
        {
            return Err(KernelError::FirmwareFault { table: "RSDT" });
        }

        let mut acpi = Acpi::default();
        let mut offset = SDT_HEADER_SIZE;
        while offset + stride <= size {
            let entry = if wide {
                u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
            } else {
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as u64
            };
            acpi.parse_table(entry)?;
            offset += stride;
        }
        Ok(acpi)
    }

    fn parse_table(&mut self, pa: u64) -> KernelResult<()> {
        let table = TableView::map(pa);
        let bytes = table.bytes();
        if !validate(bytes) {
            log::warn!("ACPI table at {pa:#x} failed its checksum, skipped");
            return Ok(());
        }
        let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        log::debug!(
            "ACPI table {} at {pa:#x}, {size} bytes",
            core::str::from_utf8(&bytes[0..4]).unwrap_or("????")
        );
        match signature {
            SIG_MADT => self.madt = Some(parse_madt(&bytes[..size])),
            SIG_FADT => {
                if self.fadt.is_some() {
                    return Err(KernelError::FirmwareFault { table: "FACP" });
                }
                self.fadt = Some(parse_fadt(&bytes[..size]));
            }
            _ => {}
        }
        Ok(())
    }

    /// The MADT, required for interrupt bring-up.
    pub fn madt(&self) -> &Madt {
        match &self.madt {
            Some(madt) => madt,
            None => bugcheck!(Reason::HardwareFault, "firmware delivered no MADT"),
        }
    }

    pub fn fadt(&self) -> &Fadt {
        match &self.fadt {
            Some(fadt) => fadt,
            None => bugcheck!(Reason::HardwareFault, "firmware delivered no FADT"),
        }
    }
}

fn parse_madt(bytes: &[u8]) -> Madt {
    let mut madt = Madt {
        local_apic_base: u32::from_le_bytes(bytes[36..40].try_into().unwrap()) as u64,
        pic_present: bytes[40] & 0x01 != 0,
        ..Madt::default()
    };
    let mut io_apic_found = false;
    let mut cursor = 44;
    while cursor + 2 <= bytes.len() {
        let kind = bytes[cursor];
        let len = bytes[cursor + 1] as usize;
        if len == 0 || cursor + len > bytes.len() {
            bugcheck!(Reason::HardwareFault, "malformed MADT entry at {cursor}");
        }
        let entry = &bytes[cursor..cursor + len];
        match kind {
            MADT_LOCAL_APIC if len == 8 => {
                // Flag bit 0: processor enabled.
                if entry[4] & 0x01 != 0 {
                    madt.processors.push(Processor {
                        uid: entry[2],
                        apic_id: entry[3],
                    });
                }
            }
            MADT_IO_APIC if len == 12 => {
                let gsi = u32::from_le_bytes(entry[8..12].try_into().unwrap());
                // Keep the I/O APIC serving the lowest GSI range.
                if !io_apic_found || gsi < madt.gsi_base {
                    madt.io_apic_base =
                        u32::from_le_bytes(entry[4..8].try_into().unwrap()) as u64;
                    madt.gsi_base = gsi;
                }
                io_apic_found = true;
            }
            MADT_SOURCE_OVERRIDE if len == 10 => {
                // Bus 0 is ISA; nothing else is architecturally defined.
                if entry[2] == 0 {
                    madt.redirects.push(Redirect {
                        gsi: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                        irq: entry[3],
                        mode: entry[8],
                    });
                }
            }
            MADT_NMI_SOURCE if len == 8 => {
                madt.redirects.push(Redirect {
                    gsi: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                    irq: 2,
                    mode: entry[2],
                });
            }
            MADT_LAPIC_NMI if len == 6 => {
                madt.nmi_pins.push(NmiPin {
                    uid: entry[2],
                    mode: entry[3],
                    pin: entry[5],
                });
            }
            MADT_LAPIC_ADDR_OVERRIDE if len == 12 => {
                madt.local_apic_base = u64::from_le_bytes(entry[4..12].try_into().unwrap());
            }
            _ => {}
        }
        cursor += len;
    }
    madt
}

fn parse_fadt(bytes: &[u8]) -> Fadt {
    let field = |off: usize| bytes.get(off).copied().unwrap_or(0);
    Fadt {
        sci_interrupt: u16::from_le_bytes([field(46), field(47)]),
        power_profile: field(45),
        century: field(108) != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::window::test_init;
    use alloc::vec;

    /// Page-aligned scratch the parser can address as "physical" memory.
    #[repr(C, align(4096))]
    struct Arena([u8; 4096]);

    fn checksum_fix(table: &mut [u8]) {
        let sum = table
            .iter()
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
        table[9] = table[9].wrapping_sub(sum);
    }

    fn sdt(signature: &[u8; 4], payload: &[u8]) -> vec::Vec<u8> {
        let mut table = vec![0u8; SDT_HEADER_SIZE + payload.len()];
        table[0..4].copy_from_slice(signature);
        let size = table.len() as u32;
        table[4..8].copy_from_slice(&size.to_le_bytes());
        table[SDT_HEADER_SIZE..].copy_from_slice(payload);
        checksum_fix(&mut table);
        table
    }

    fn madt_payload() -> vec::Vec<u8> {
        let mut payload = vec![];
        payload.extend_from_slice(&0xFEE0_0000u32.to_le_bytes()); // LAPIC base
        payload.extend_from_slice(&1u32.to_le_bytes()); // flags: 8259 present
        // Two enabled processors, one disabled.
        payload.extend_from_slice(&[0, 8, 0, 10, 1, 0, 0, 0]);
        payload.extend_from_slice(&[0, 8, 1, 11, 1, 0, 0, 0]);
        payload.extend_from_slice(&[0, 8, 2, 12, 0, 0, 0, 0]);
        // I/O APIC at GSI 0.
        let mut ioapic = vec![1u8, 12, 9, 0];
        ioapic.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        ioapic.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&ioapic);
        // ISA IRQ0 -> GSI2, level/low.
        let mut iso = vec![2u8, 10, 0, 0];
        iso.extend_from_slice(&2u32.to_le_bytes());
        iso.extend_from_slice(&[0x0F, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&iso);
        // LAPIC NMI on pin 1 for every processor.
        payload.extend_from_slice(&[4, 6, 0xFF, 5, 0, 1]);
        payload
    }

    #[test]
    fn parses_madt_and_fadt_chain() {
        test_init();
        let arena = alloc::boxed::Box::leak(alloc::boxed::Box::new(Arena([0; 4096])));
        let base = arena.0.as_ptr() as u64;

        let madt = sdt(b"APIC", &madt_payload());
        let mut fadt_payload = vec![0u8; 100];
        fadt_payload[9] = 2; // power profile (offset 45)
        fadt_payload[10] = 9; // SCI (offset 46)
        fadt_payload[72] = 0x20; // century (offset 108)
        let fadt = sdt(b"FACP", &fadt_payload);

        let madt_pa = base + 0x100;
        let fadt_pa = base + 0x400;
        arena.0[0x100..0x100 + madt.len()].copy_from_slice(&madt);
        arena.0[0x400..0x400 + fadt.len()].copy_from_slice(&fadt);

        let mut rsdt_payload = vec![];
        rsdt_payload.extend_from_slice(&(madt_pa as u32).to_le_bytes());
        rsdt_payload.extend_from_slice(&(fadt_pa as u32).to_le_bytes());
        let rsdt = sdt(b"RSDT", &rsdt_payload);
        arena.0[0x800..0x800 + rsdt.len()].copy_from_slice(&rsdt);

        let rsdp = PhysicalAddress::new(base + 0x800); // top byte 0: RSDT
        let acpi = Acpi::parse(rsdp).unwrap();

        let madt = acpi.madt();
        assert_eq!(madt.local_apic_base, 0xFEE0_0000);
        assert!(madt.pic_present);
        assert_eq!(madt.processors.len(), 2);
        assert_eq!(madt.processors[0].apic_id, 10);
        assert_eq!(madt.io_apic_base, 0xFEC0_0000);
        assert_eq!(madt.redirects.len(), 1);
        assert_eq!(madt.redirects[0].irq, 0);
        assert_eq!(madt.redirects[0].gsi, 2);
        assert_eq!(madt.nmi_pins.len(), 1);
        assert_eq!(madt.nmi_pins[0].pin, 1);

        let fadt = acpi.fadt();
        assert_eq!(fadt.sci_interrupt, 9);
        assert_eq!(fadt.power_profile, 2);
        assert!(fadt.century);
    }

    #[test]
    fn corrupt_root_is_a_firmware_fault() {
        test_init();
        let arena = alloc::boxed::Box::leak(alloc::boxed::Box::new(Arena([0; 4096])));
        let base = arena.0.as_ptr() as u64;
        let mut rsdt = sdt(b"RSDT", &[]);
        rsdt[10] ^= 0xFF; // break the checksum
        arena.0[..rsdt.len()].copy_from_slice(&rsdt);
        assert!(matches!(
            Acpi::parse(PhysicalAddress::new(base)),
            Err(KernelError::FirmwareFault { table: "RSDT" })
        ));
    }

    #[test]
    fn broken_leaf_table_is_skipped() {
        test_init();
        let arena = alloc::boxed::Box::leak(alloc::boxed::Box::new(Arena([0; 4096])));
        let base = arena.0.as_ptr() as u64;
        let mut madt = sdt(b"APIC", &madt_payload());
        madt[12] ^= 0xFF; // break the leaf checksum
        arena.0[0x100..0x100 + madt.len()].copy_from_slice(&madt);
        let mut rsdt_payload = vec![];
        rsdt_payload.extend_from_slice(&((base + 0x100) as u32).to_le_bytes());
        let rsdt = sdt(b"RSDT", &rsdt_payload);
        arena.0[0x800..0x800 + rsdt.len()].copy_from_slice(&rsdt);
        let acpi = Acpi::parse(PhysicalAddress::new(base + 0x800)).unwrap();
        assert!(acpi.madt.is_none());
    }
}
