//! UDS service layer for flashloader communication

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use super::{routine_sub_function, service_id, NegativeResponseCode, UdsError};
use crate::transport::TransportAdapter;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_millis(30000);
const RESPONSE_PENDING_POLL: Duration = Duration::from_millis(100);

/// Address and length format used for RequestDownload: 4 byte size, 4 byte address
const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;

/// UDS service layer on top of one node channel
#[derive(Clone)]
pub struct UdsService {
    transport: Arc<dyn TransportAdapter>,
    timeout: Duration,
}

impl UdsService {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request with the default timeout
    async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.send_request_with_timeout(request, self.timeout).await
    }

    /// Send a request and handle response pending
    async fn send_request_with_timeout(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, UdsError> {
        let sid = *request
            .first()
            .ok_or_else(|| UdsError::InvalidResponse("Empty request".to_string()))?;
        let start = Instant::now();

        loop {
            let response = self.transport.send_receive(request, timeout).await?;
            trace!(request = ?request, response = ?response, "UDS exchange");

            // Check for negative response
            if response.first() == Some(&service_id::NEGATIVE_RESPONSE) {
                if response.len() < 3 {
                    return Err(UdsError::InvalidResponse(
                        "Negative response too short".to_string(),
                    ));
                }

                let service_id = response[1];
                let nrc = NegativeResponseCode::from(response[2]);

                // Handle response pending
                if nrc == NegativeResponseCode::ResponsePending {
                    if start.elapsed() > RESPONSE_PENDING_TIMEOUT {
                        return Err(UdsError::Timeout);
                    }
                    tokio::time::sleep(RESPONSE_PENDING_POLL).await;
                    continue;
                }

                return Err(UdsError::NegativeResponse { service_id, nrc });
            }

            let expected = sid.wrapping_add(service_id::POSITIVE_RESPONSE_OFFSET);
            if response.first() != Some(&expected) {
                return Err(UdsError::InvalidResponse(format!(
                    "Expected response 0x{:02X}, got {:02X?}",
                    expected,
                    response.first()
                )));
            }

            return Ok(response);
        }
    }

    /// Diagnostic Session Control (0x10)
    pub async fn diagnostic_session_control(&self, session: u8) -> Result<Vec<u8>, UdsError> {
        let request = vec![service_id::DIAGNOSTIC_SESSION_CONTROL, session];
        self.send_request(&request).await
    }

    /// Security Access - Request Seed (0x27 odd)
    pub async fn security_access_request_seed(&self, level: u8) -> Result<Vec<u8>, UdsError> {
        // Seed sub-functions are odd (0x01, 0x03, 0x05, etc.)
        let sub_function = level.saturating_mul(2).saturating_sub(1);
        let request = vec![service_id::SECURITY_ACCESS, sub_function];
        let response = self.send_request(&request).await?;

        // Response: 0x67 [sub_function] [seed...]
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "Seed response too short".to_string(),
            ));
        }

        Ok(response[2..].to_vec())
    }

    /// Security Access - Send Key (0x27 even)
    pub async fn security_access_send_key(&self, level: u8, key: &[u8]) -> Result<(), UdsError> {
        let sub_function = level.saturating_mul(2);
        let mut request = vec![service_id::SECURITY_ACCESS, sub_function];
        request.extend_from_slice(key);

        self.send_request(&request).await?;
        Ok(())
    }

    /// Read Data By Identifier (0x22) for a single DID; returns the record data
    pub async fn read_data_by_id(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![service_id::READ_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());

        let response = self.send_request(&request).await?;

        // Response: 0x62 [didHi] [didLo] [data...]
        if response.len() < 3 || response[1..3] != did.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "ReadDataByIdentifier response does not echo DID 0x{:04X}",
                did
            )));
        }

        Ok(response[3..].to_vec())
    }

    /// Write Data By Identifier (0x2E)
    pub async fn write_data_by_id(&self, did: u16, data: &[u8]) -> Result<(), UdsError> {
        self.send_request(&write_data_by_id_request(did, data))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Routine Control (0x31)
    // =========================================================================

    /// Start a routine (sub-function 0x01); returns the routine status record
    pub async fn routine_control_start(
        &self,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![
            service_id::ROUTINE_CONTROL,
            routine_sub_function::START_ROUTINE,
        ];
        request.extend_from_slice(&routine_id.to_be_bytes());
        request.extend_from_slice(params);

        let response = self.send_request(&request).await?;

        // Response: 0x71 [sub-function] [routineIdHi] [routineIdLo] [routineInfo...]
        if response.len() < 4 {
            return Err(UdsError::InvalidResponse(
                "Routine response too short".to_string(),
            ));
        }

        Ok(response[4..].to_vec())
    }

    // =========================================================================
    // Programming Services (0x34, 0x36, 0x37, 0x11)
    // =========================================================================

    /// Request Download (0x34) - erases the memory range and returns the
    /// usable payload per TransferData request
    pub async fn request_download(
        &self,
        address: u32,
        size: u32,
        timeout: Duration,
    ) -> Result<u32, UdsError> {
        let mut request = vec![
            service_id::REQUEST_DOWNLOAD,
            0x00,
            ADDRESS_AND_LENGTH_FORMAT,
        ];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&size.to_be_bytes());

        let response = self.send_request_with_timeout(&request, timeout).await?;

        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response too short".to_string(),
            ));
        }

        let length_format = response[1];
        let num_bytes = (length_format >> 4) as usize;

        if num_bytes == 0 || num_bytes > 4 || response.len() < 2 + num_bytes {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response missing maxBlockLength".to_string(),
            ));
        }

        let max_block_length = response[2..2 + num_bytes]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32);

        // maxBlockLength includes the service ID and the block counter
        Ok(max_block_length.saturating_sub(2))
    }

    /// Transfer Data (0x36) - returns the echoed block counter
    pub async fn transfer_data(
        &self,
        block_counter: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<u8, UdsError> {
        let mut request = Vec::with_capacity(data.len() + 2);
        request.push(service_id::TRANSFER_DATA);
        request.push(block_counter);
        request.extend_from_slice(data);

        let response = self.send_request_with_timeout(&request, timeout).await?;

        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "TransferData response too short".to_string(),
            ));
        }
        if response[1] != block_counter {
            return Err(UdsError::InvalidResponse(format!(
                "TransferData echoed block {} instead of {}",
                response[1], block_counter
            )));
        }

        Ok(response[1])
    }

    /// Request Transfer Exit (0x37)
    pub async fn request_transfer_exit(&self) -> Result<Vec<u8>, UdsError> {
        let response = self
            .send_request(&[service_id::REQUEST_TRANSFER_EXIT])
            .await?;
        Ok(response[1..].to_vec())
    }

    /// ECU Reset (0x11) - returns the power down time if reported
    pub async fn ecu_reset(&self, reset_type: u8) -> Result<Option<u8>, UdsError> {
        let response = self.send_request(&ecu_reset_request(reset_type)).await?;

        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "ECUReset response too short".to_string(),
            ));
        }

        Ok(response.get(2).copied())
    }
}

/// Raw WriteDataByIdentifier request, also used for broadcasts
pub fn write_data_by_id_request(did: u16, data: &[u8]) -> Vec<u8> {
    let mut request = vec![service_id::WRITE_DATA_BY_ID];
    request.extend_from_slice(&did.to_be_bytes());
    request.extend_from_slice(data);
    request
}

/// Raw ECUReset request, also used for broadcasts
pub fn ecu_reset_request(reset_type: u8) -> Vec<u8> {
    vec![service_id::ECU_RESET, reset_type]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AddressInfo, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Channel answering with a fixed script of responses
    struct ScriptedChannel {
        responses: Mutex<VecDeque<Vec<u8>>>,
        requests: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedChannel {
        fn new(responses: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TransportAdapter for ScriptedChannel {
        async fn send_receive(
            &self,
            request: &[u8],
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            self.requests.lock().push(request.to_vec());
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| TransportError::Timeout("no response".to_string()))
        }

        async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
            self.requests.lock().push(request.to_vec());
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn address_info(&self) -> AddressInfo {
            AddressInfo::default()
        }
    }

    #[tokio::test]
    async fn test_read_data_by_id_strips_header() {
        let channel = ScriptedChannel::new(vec![vec![0x62, 0xF1, 0x97, b'A', b'B']]);
        let uds = UdsService::new(channel.clone());
        let data = uds.read_data_by_id(0xF197).await.unwrap();
        assert_eq!(data, b"AB");
        assert_eq!(channel.requests.lock()[0], vec![0x22, 0xF1, 0x97]);
    }

    #[tokio::test]
    async fn test_read_data_by_id_rejects_wrong_did() {
        let channel = ScriptedChannel::new(vec![vec![0x62, 0xF1, 0x80, 0x00]]);
        let uds = UdsService::new(channel);
        let err = uds.read_data_by_id(0xF197).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_negative_response() {
        let channel = ScriptedChannel::new(vec![vec![0x7F, 0x34, 0x31]]);
        let uds = UdsService::new(channel);
        let err = uds
            .request_download(0x1000, 0x100, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestOutOfRange));
    }

    #[tokio::test]
    async fn test_response_pending_is_retried() {
        let channel = ScriptedChannel::new(vec![
            vec![0x7F, 0x34, 0x78],
            vec![0x74, 0x20, 0x01, 0x02],
        ]);
        let uds = UdsService::new(channel.clone());
        let max = uds
            .request_download(0x1000, 0x100, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(max, 0x0102 - 2);
        assert_eq!(channel.requests.lock().len(), 2);
        assert_eq!(
            channel.requests.lock()[0],
            vec![0x34, 0x00, 0x44, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[tokio::test]
    async fn test_unexpected_positive_response() {
        let channel = ScriptedChannel::new(vec![vec![0x50, 0x02]]);
        let uds = UdsService::new(channel);
        let err = uds.ecu_reset(0x01).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_security_sub_functions() {
        let channel = ScriptedChannel::new(vec![
            vec![0x67, 0x03, 0x12, 0x34],
            vec![0x67, 0x04],
        ]);
        let uds = UdsService::new(channel.clone());
        let seed = uds.security_access_request_seed(2).await.unwrap();
        assert_eq!(seed, vec![0x12, 0x34]);
        uds.security_access_send_key(2, &[0xAA]).await.unwrap();
        let requests = channel.requests.lock();
        assert_eq!(requests[0], vec![0x27, 0x03]);
        assert_eq!(requests[1], vec![0x27, 0x04, 0xAA]);
    }

    #[tokio::test]
    async fn test_transfer_data_counter_echo() {
        let channel = ScriptedChannel::new(vec![vec![0x76, 0x02]]);
        let uds = UdsService::new(channel);
        let err = uds
            .transfer_data(0x01, &[0xAA], DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }
}
