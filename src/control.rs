//! The `MZHV` control-device surface.
//!
//! The embedding driver owns the actual device object; this module owns
//! everything portable about it: the names, the I/O-control code
//! composition, and the buffered-request parsing that turns an input
//! buffer of caller pointers into [`crate::mapping`] calls.

use log::debug;

use crate::addressing::Hva;
use crate::mapping;
use crate::platform::Platform;
use crate::HvError;

/// Kernel device name.
pub const NT_DEVICE_NAME: &str = r"\Device\MZHV";
/// User-visible DOS device name.
pub const DOS_DEVICE_NAME: &str = r"\DosDevices\MZHV";

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// Compose an NT I/O-control code.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Install a mapping: input is `{original, rw, fetch}` caller pointers.
pub const IOCTL_MAP: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x1337, METHOD_BUFFERED, FILE_ANY_ACCESS);
/// Remove a mapping: input is `{original}`.
pub const IOCTL_UNMAP: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x2137, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// `create` on the device: succeeds, no side effect.
pub fn handle_create() -> Result<(), HvError> {
    debug!("control: create");
    Ok(())
}

/// `close` on the device: succeeds, no side effect.
pub fn handle_close() -> Result<(), HvError> {
    debug!("control: close");
    Ok(())
}

/// Dispatch a buffered device-control request.
///
/// Pointers arrive as native-endian 64-bit values; a buffer shorter than
/// the operation's pointer count is an invalid parameter, as is an
/// unknown control code.
pub fn handle_device_control<P: Platform>(
    p: &P,
    code: u32,
    input: &[u8],
) -> Result<(), HvError> {
    debug!("control: device control {code:#x}, {} input bytes", input.len());
    match code {
        IOCTL_MAP => {
            let [original, rw, fetch] = read_pointers::<3>(input)?;
            mapping::install(p, original, rw, fetch)
        }
        IOCTL_UNMAP => {
            let [original] = read_pointers::<1>(input)?;
            mapping::remove(p, original)
        }
        _ => Err(HvError::InvalidParameter),
    }
}

fn read_pointers<const N: usize>(input: &[u8]) -> Result<[Hva; N], HvError> {
    if input.len() < N * 8 {
        return Err(HvError::InvalidParameter);
    }
    let mut pointers = [Hva::new(0); N];
    for (index, pointer) in pointers.iter_mut().enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&input[index * 8..index * 8 + 8]);
        *pointer = Hva::new(u64::from_ne_bytes(bytes));
    }
    Ok(pointers)
}
