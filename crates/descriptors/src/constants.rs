//! USB standard constants
//!
//! Class codes, descriptor types, standard requests and request type bits as
//! defined by chapter 9 of the USB 2.0 specification.

// Device and interface class codes
pub const CLASS_PER_INTERFACE: u8 = 0x00;
pub const CLASS_AUDIO: u8 = 0x01;
pub const CLASS_COMM: u8 = 0x02;
pub const CLASS_HID: u8 = 0x03;
pub const CLASS_PRINTER: u8 = 0x07;
pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const CLASS_HUB: u8 = 0x09;
pub const CLASS_DATA: u8 = 0x0a;
pub const CLASS_VENDOR_SPEC: u8 = 0xff;

// Descriptor types
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_HID: u8 = 0x21;
pub const DT_REPORT: u8 = 0x22;
pub const DT_PHYSICAL: u8 = 0x23;
pub const DT_HUB: u8 = 0x29;

// Descriptor sizes
pub const DT_DEVICE_SIZE: usize = 18;
pub const DT_CONFIG_SIZE: usize = 9;
pub const DT_INTERFACE_SIZE: usize = 9;
pub const DT_ENDPOINT_SIZE: usize = 7;
pub const DT_ENDPOINT_AUDIO_SIZE: usize = 9;
pub const DT_HUB_NONVAR_SIZE: usize = 7;

// Limits
pub const MAXENDPOINTS: usize = 32;
pub const MAXINTERFACES: usize = 32;
pub const MAXALTSETTING: usize = 128;
pub const MAXCONFIG: usize = 8;

// Endpoint address and attribute masks
pub const ENDPOINT_ADDRESS_MASK: u8 = 0x0f;
pub const ENDPOINT_DIR_MASK: u8 = 0x80;
pub const ENDPOINT_TYPE_MASK: u8 = 0x03;
pub const ENDPOINT_TYPE_CONTROL: u8 = 0x00;
pub const ENDPOINT_TYPE_ISOCHRONOUS: u8 = 0x01;
pub const ENDPOINT_TYPE_BULK: u8 = 0x02;
pub const ENDPOINT_TYPE_INTERRUPT: u8 = 0x03;
pub const ENDPOINT_IN: u8 = 0x80;
pub const ENDPOINT_OUT: u8 = 0x00;

// Standard requests (bRequest)
pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_DESCRIPTOR: u8 = 0x07;
pub const REQ_GET_CONFIGURATION: u8 = 0x08;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_GET_INTERFACE: u8 = 0x0a;
pub const REQ_SET_INTERFACE: u8 = 0x0b;
pub const REQ_SYNCH_FRAME: u8 = 0x0c;

// Request type bits (bmRequestType)
pub const TYPE_STANDARD: u8 = 0x00 << 5;
pub const TYPE_CLASS: u8 = 0x01 << 5;
pub const TYPE_VENDOR: u8 = 0x02 << 5;
pub const TYPE_RESERVED: u8 = 0x03 << 5;

pub const RECIP_DEVICE: u8 = 0x00;
pub const RECIP_INTERFACE: u8 = 0x01;
pub const RECIP_ENDPOINT: u8 = 0x02;
pub const RECIP_OTHER: u8 = 0x03;

/// Feature selector for CLEAR_FEATURE(ENDPOINT_HALT)
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// LANGID for US English, used when a device reports no language table
pub const LANG_ID_EN_US: u16 = 0x0409;

/// Build a bmRequestType byte from its three fields
///
/// `direction` is [`ENDPOINT_IN`] or [`ENDPOINT_OUT`], `kind` one of the
/// `TYPE_*` constants and `recipient` one of the `RECIP_*` constants.
pub const fn request_type(direction: u8, kind: u8, recipient: u8) -> u8 {
    (direction & ENDPOINT_DIR_MASK) | (kind & 0x60) | (recipient & 0x1f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type() {
        assert_eq!(request_type(ENDPOINT_IN, TYPE_STANDARD, RECIP_DEVICE), 0x80);
        assert_eq!(request_type(ENDPOINT_OUT, TYPE_VENDOR, RECIP_INTERFACE), 0x41);
        assert_eq!(request_type(ENDPOINT_IN, TYPE_CLASS, RECIP_ENDPOINT), 0xa2);
    }
}
