//! # Sensor Access
//!
//! Request/response access to connected sensors and the device information
//! shown next to a sensor (battery, clock, UART setting, firmware app).
//!
//! The transport is behind `SensorAccess`; every request gets exactly one
//! response or error.

use crate::error::SensorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Battery level at or below which a sensor counts as low on energy
pub const LOW_ENERGY_PERCENT: u8 = 20;

/// Extra attempts for the energy read; it fails once after a firmware update
const ENERGY_READ_RETRIES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    SystemEnergy,
    SystemTime,
    SettingsUartOn,
    AppInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestParameter {
    /// Device clock, microseconds since the Unix epoch
    SystemTime(i64),
    SettingsUartOn(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRequest {
    pub resource: Resource,
    pub method: Method,
    pub parameter: Option<RequestParameter>,
}

impl SensorRequest {
    pub fn get(resource: Resource) -> Self {
        Self {
            resource,
            method: Method::Get,
            parameter: None,
        }
    }

    pub fn put(resource: Resource, parameter: RequestParameter) -> Self {
        Self {
            resource,
            method: Method::Put,
            parameter: Some(parameter),
        }
    }
}

/// HTTP-style status code returned by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const OK: ResponseCode = ResponseCode(200);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    SystemEnergy { percentage: u8 },
    /// Microseconds since the Unix epoch
    SystemTime(i64),
    SettingsUartOn(bool),
    AppInfo(AppInfo),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorResponse {
    pub code: ResponseCode,
    pub payload: ResponsePayload,
}

/// Transport to the connected sensors
#[async_trait]
pub trait SensorAccess: Send + Sync {
    /// Serial numbers of the currently reachable sensors
    async fn devices(&self) -> Vec<String>;

    async fn request(&self, serial: &str, request: SensorRequest) -> Result<SensorResponse, SensorError>;
}

/// Last known device information of one sensor; `None` means unknown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorInfo {
    pub serial: String,
    pub energy_percent: Option<u8>,
    pub time_micros: Option<i64>,
    pub uart_on: Option<bool>,
    pub app_info: Option<AppInfo>,
}

impl SensorInfo {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            ..Default::default()
        }
    }

    pub fn is_energy_low(&self) -> bool {
        self.energy_percent
            .is_some_and(|percent| percent <= LOW_ENERGY_PERCENT)
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        let micros = self.time_micros?;
        DateTime::from_timestamp(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as u32,
        )
    }

    async fn is_reachable(&self, access: &dyn SensorAccess) -> bool {
        access.devices().await.iter().any(|s| *s == self.serial)
    }

    /// Read energy, time, UART state and app info in that order.
    ///
    /// A failed step leaves its field unknown and the sequence goes on.
    /// Returns false, without touching anything, if the sensor is not
    /// reachable.
    pub async fn refresh(&mut self, access: &dyn SensorAccess) -> bool {
        if !self.is_reachable(access).await {
            log::debug!("Sensor {} not reachable, info not refreshed", self.serial);
            return false;
        }

        self.energy_percent = self.read_energy(access).await;
        self.time_micros = self.read_time(access).await;
        self.uart_on = self.read_uart(access).await;
        self.app_info = self.read_app_info(access).await;
        true
    }

    async fn get(&self, access: &dyn SensorAccess, resource: Resource) -> Result<ResponsePayload, SensorError> {
        let response = access.request(&self.serial, SensorRequest::get(resource)).await?;
        Ok(response.payload)
    }

    fn unexpected(&self, resource: Resource, payload: &ResponsePayload) -> SensorError {
        SensorError::UnexpectedResponse {
            device: self.serial.clone(),
            detail: format!("{:?} for {:?}", payload, resource),
        }
    }

    async fn read_energy(&self, access: &dyn SensorAccess) -> Option<u8> {
        let mut attempt = 0;
        loop {
            match self.get(access, Resource::SystemEnergy).await {
                Ok(ResponsePayload::SystemEnergy { percentage }) => return Some(percentage),
                Ok(other) => {
                    log::warn!("{}", self.unexpected(Resource::SystemEnergy, &other));
                    return None;
                }
                Err(e @ SensorError::Operation { .. }) if attempt < ENERGY_READ_RETRIES => {
                    log::debug!("Energy read failed, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("Energy read failed: {}", e);
                    return None;
                }
            }
        }
    }

    async fn read_time(&self, access: &dyn SensorAccess) -> Option<i64> {
        match self.get(access, Resource::SystemTime).await {
            Ok(ResponsePayload::SystemTime(micros)) => Some(micros),
            Ok(other) => {
                log::warn!("{}", self.unexpected(Resource::SystemTime, &other));
                None
            }
            Err(e) => {
                log::warn!("Time read failed: {}", e);
                None
            }
        }
    }

    async fn read_uart(&self, access: &dyn SensorAccess) -> Option<bool> {
        match self.get(access, Resource::SettingsUartOn).await {
            Ok(ResponsePayload::SettingsUartOn(on)) => Some(on),
            Ok(other) => {
                log::warn!("{}", self.unexpected(Resource::SettingsUartOn, &other));
                None
            }
            Err(e) => {
                log::warn!("UART state read failed: {}", e);
                None
            }
        }
    }

    async fn read_app_info(&self, access: &dyn SensorAccess) -> Option<AppInfo> {
        match self.get(access, Resource::AppInfo).await {
            Ok(ResponsePayload::AppInfo(info)) => Some(info),
            Ok(other) => {
                log::warn!("{}", self.unexpected(Resource::AppInfo, &other));
                None
            }
            Err(e) => {
                log::warn!("App info read failed: {}", e);
                None
            }
        }
    }

    /// Flip the UART setting and re-read it if the device accepted.
    ///
    /// Returns Ok(false) when the current state is unknown or the device
    /// answered with a non-OK code.
    pub async fn toggle_uart(&mut self, access: &dyn SensorAccess) -> Result<bool, SensorError> {
        let Some(current) = self.uart_on else {
            return Ok(false);
        };
        let request = SensorRequest::put(Resource::SettingsUartOn, RequestParameter::SettingsUartOn(!current));
        if !self.put(access, request).await? {
            return Ok(false);
        }
        self.uart_on = self.read_uart(access).await;
        Ok(true)
    }

    /// Set the device clock to the host's current time
    pub async fn set_current_time(&mut self, access: &dyn SensorAccess) -> Result<bool, SensorError> {
        self.set_time(access, Utc::now().timestamp_micros()).await
    }

    /// Set the device clock and re-read it if the device accepted
    pub async fn set_time(&mut self, access: &dyn SensorAccess, micros: i64) -> Result<bool, SensorError> {
        let request = SensorRequest::put(Resource::SystemTime, RequestParameter::SystemTime(micros));
        if !self.put(access, request).await? {
            return Ok(false);
        }
        self.time_micros = self.read_time(access).await;
        Ok(true)
    }

    async fn put(&self, access: &dyn SensorAccess, request: SensorRequest) -> Result<bool, SensorError> {
        if !self.is_reachable(access).await {
            return Err(SensorError::NotConnected(self.serial.clone()));
        }
        let resource = request.resource;
        let response = access.request(&self.serial, request).await?;
        if response.code.is_ok() {
            Ok(true)
        } else {
            log::warn!(
                "Sensor {} rejected {:?} update with code {}",
                self.serial,
                resource,
                response.code.0
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const SERIAL: &str = "174630000192";

    /// Scripted sensor keeping UART and clock state
    struct FakeSensor {
        connected: bool,
        energy_failures: Mutex<usize>,
        time_fails: bool,
        reject_puts: bool,
        uart_on: Mutex<bool>,
        time: Mutex<i64>,
        requests: Mutex<Vec<SensorRequest>>,
    }

    impl FakeSensor {
        fn new() -> Self {
            Self {
                connected: true,
                energy_failures: Mutex::new(0),
                time_fails: false,
                reject_puts: false,
                uart_on: Mutex::new(false),
                time: Mutex::new(1_000_000),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn resources(&self) -> Vec<(Resource, Method)> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| (r.resource, r.method))
                .collect()
        }
    }

    fn ok(payload: ResponsePayload) -> Result<SensorResponse, SensorError> {
        Ok(SensorResponse {
            code: ResponseCode::OK,
            payload,
        })
    }

    #[async_trait]
    impl SensorAccess for FakeSensor {
        async fn devices(&self) -> Vec<String> {
            if self.connected {
                vec![SERIAL.to_string()]
            } else {
                Vec::new()
            }
        }

        async fn request(&self, serial: &str, request: SensorRequest) -> Result<SensorResponse, SensorError> {
            self.requests.lock().unwrap().push(request.clone());
            let operation_error = || SensorError::Operation {
                device: serial.to_string(),
                reason: "timeout".to_string(),
            };

            if request.method == Method::Put {
                if self.reject_puts {
                    return Ok(SensorResponse {
                        code: ResponseCode(400),
                        payload: ResponsePayload::Empty,
                    });
                }
                match request.parameter {
                    Some(RequestParameter::SettingsUartOn(on)) => *self.uart_on.lock().unwrap() = on,
                    Some(RequestParameter::SystemTime(micros)) => *self.time.lock().unwrap() = micros,
                    None => return Err(operation_error()),
                }
                return ok(ResponsePayload::Empty);
            }

            match request.resource {
                Resource::SystemEnergy => {
                    let mut failures = self.energy_failures.lock().unwrap();
                    if *failures > 0 {
                        *failures -= 1;
                        return Err(operation_error());
                    }
                    ok(ResponsePayload::SystemEnergy { percentage: 18 })
                }
                Resource::SystemTime if self.time_fails => Err(operation_error()),
                Resource::SystemTime => ok(ResponsePayload::SystemTime(*self.time.lock().unwrap())),
                Resource::SettingsUartOn => ok(ResponsePayload::SettingsUartOn(*self.uart_on.lock().unwrap())),
                Resource::AppInfo => ok(ResponsePayload::AppInfo(AppInfo {
                    name: "Showcase".to_string(),
                    version: "1.0.1".to_string(),
                    company: "Acme".to_string(),
                })),
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_reads_all_fields_in_order() {
        let sensor = FakeSensor::new();
        let mut info = SensorInfo::new(SERIAL);

        assert!(info.refresh(&sensor).await);
        assert_eq!(info.energy_percent, Some(18));
        assert!(info.is_energy_low());
        assert_eq!(info.time_micros, Some(1_000_000));
        assert_eq!(info.time(), DateTime::from_timestamp(1, 0));
        assert_eq!(info.uart_on, Some(false));
        assert_eq!(info.app_info.as_ref().map(|a| a.version.as_str()), Some("1.0.1"));
        assert_eq!(
            sensor.resources(),
            vec![
                (Resource::SystemEnergy, Method::Get),
                (Resource::SystemTime, Method::Get),
                (Resource::SettingsUartOn, Method::Get),
                (Resource::AppInfo, Method::Get),
            ]
        );
    }

    #[tokio::test]
    async fn test_energy_read_retried_once() {
        let sensor = FakeSensor::new();
        *sensor.energy_failures.lock().unwrap() = 1;
        let mut info = SensorInfo::new(SERIAL);

        info.refresh(&sensor).await;
        assert_eq!(info.energy_percent, Some(18));
        assert_eq!(sensor.resources().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_steps_become_unknown() {
        let mut sensor = FakeSensor::new();
        *sensor.energy_failures.lock().unwrap() = 2;
        sensor.time_fails = true;
        let mut info = SensorInfo::new(SERIAL);
        info.energy_percent = Some(90);

        assert!(info.refresh(&sensor).await);
        assert_eq!(info.energy_percent, None);
        assert!(!info.is_energy_low());
        assert_eq!(info.time_micros, None);
        // The sequence continues past failures
        assert_eq!(info.uart_on, Some(false));
        assert!(info.app_info.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_sensor_is_not_refreshed() {
        let mut sensor = FakeSensor::new();
        sensor.connected = false;
        let mut info = SensorInfo::new(SERIAL);
        info.energy_percent = Some(50);

        assert!(!info.refresh(&sensor).await);
        assert_eq!(info.energy_percent, Some(50));
        assert!(sensor.resources().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_uart_rereads_state() {
        let sensor = FakeSensor::new();
        let mut info = SensorInfo::new(SERIAL);

        // Unknown state: nothing to toggle
        assert!(!info.toggle_uart(&sensor).await.unwrap());
        assert!(sensor.resources().is_empty());

        info.refresh(&sensor).await;
        assert!(info.toggle_uart(&sensor).await.unwrap());
        assert_eq!(info.uart_on, Some(true));
    }

    #[tokio::test]
    async fn test_rejected_put_keeps_state() {
        let mut sensor = FakeSensor::new();
        sensor.reject_puts = true;
        let mut info = SensorInfo::new(SERIAL);
        info.refresh(&sensor).await;

        assert!(!info.set_time(&sensor, 42).await.unwrap());
        assert_eq!(info.time_micros, Some(1_000_000));
        assert!(!info.toggle_uart(&sensor).await.unwrap());
        assert_eq!(info.uart_on, Some(false));
    }

    #[tokio::test]
    async fn test_set_current_time() {
        let sensor = FakeSensor::new();
        let mut info = SensorInfo::new(SERIAL);
        let before = Utc::now().timestamp_micros();

        assert!(info.set_current_time(&sensor).await.unwrap());
        assert!(info.time_micros.is_some_and(|t| t >= before));
    }

    #[tokio::test]
    async fn test_put_to_disconnected_sensor_fails() {
        let mut sensor = FakeSensor::new();
        sensor.connected = false;
        let mut info = SensorInfo::new(SERIAL);

        let err = info.set_time(&sensor, 42).await.unwrap_err();
        assert_eq!(err, SensorError::NotConnected(SERIAL.to_string()));
    }
}
