//! sensor-devices: register-level drivers for the ADC128D818 and INA260

mod error;
pub use error::{DeviceError, Result};

pub mod device;
pub use device::{
    BoundSensor, Device, DynSensor, Reading, Register, RegisterDevice, RegisterMap,
    RegisterWidth, Sensor, SensorKind,
};

pub mod adc128d818;
pub use adc128d818::{
    Adc128d818, Adc128d818Config, AdcSample, AdcState, ChannelReading, ConversionWait,
    VoltageReference,
};

pub mod ina260;
pub use ina260::{
    Averaging, ConversionTime, Ina260, Ina260Config, InaState, OperatingMode, PowerReading,
};
