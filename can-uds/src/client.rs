//! Request/response conversation with one server over an ISO-TP connection.

use std::collections::BTreeMap;
use std::time::Duration;

use isotp_engine::{IsoTpReader, IsoTpWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{Nrc, UdsError};
use crate::services::{
    DtcCount, DtcReport, MemoryLocation, Reply, Request, Response, dtc_report, key_level,
    parse_max_block_length, parse_reply, routine, seed_level, sid,
};

/// Client-side timing and data identifier layout.
#[derive(Debug, Clone)]
pub struct UdsConfig {
    /// How long to wait for the first response (P2 client).
    pub request_timeout: Duration,
    /// How long to wait after each ResponsePending (P2* client).
    pub pending_timeout: Duration,
    /// Record length of each data identifier, needed to split multi-identifier reads.
    pub did_lengths: BTreeMap<u16, usize>,
    /// Accept trailing zero bytes after the last record of a multi-identifier read.
    pub tolerate_zero_padding: bool,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(5),
            did_lengths: BTreeMap::new(),
            tolerate_zero_padding: true,
        }
    }
}

/// UDS client bound to one ISO-TP connection.
pub struct UdsClient {
    reader: IsoTpReader,
    writer: IsoTpWriter,
    config: UdsConfig,
    cancel: CancellationToken,
}

impl UdsClient {
    pub fn new(reader: IsoTpReader, writer: IsoTpWriter) -> Self {
        Self::with_config(reader, writer, UdsConfig::default())
    }

    pub fn with_config(reader: IsoTpReader, writer: IsoTpWriter, config: UdsConfig) -> Self {
        Self {
            reader,
            writer,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &UdsConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut UdsConfig {
        &mut self.config
    }

    /// Token that aborts whatever request is in flight. A fresh one is armed afterwards.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send `request` and wait for its final response.
    ///
    /// Returns `None` when the positive response was suppressed. ResponsePending answers extend
    /// the wait by [`UdsConfig::pending_timeout`] each; any other negative response becomes
    /// [`UdsError::Negative`].
    pub async fn send_request(
        &mut self,
        request: &Request,
        suppress_positive_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>, UdsError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let payload = request.encode(suppress_positive_response)?;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let stale = self.reader.discard_pending();
        if stale > 0 {
            tracing::debug!(stale, "dropped unsolicited responses");
        }

        tracing::debug!(service = request.service, len = payload.len(), "request");
        self.writer
            .write_with(&payload, Instant::now() + timeout, &self.cancel)
            .await?;
        if suppress_positive_response {
            return Ok(None);
        }

        let mut deadline = Instant::now() + timeout;
        loop {
            let received = self.reader.read_with(deadline, &self.cancel).await?;
            match parse_reply(&received.payload)? {
                Reply::Negative {
                    service,
                    nrc: Nrc::ResponsePending,
                } if service == request.service => {
                    tracing::debug!(service, "response pending");
                    deadline = Instant::now() + self.config.pending_timeout;
                }
                Reply::Negative { service, nrc } if service == request.service => {
                    tracing::debug!(service, %nrc, "negative response");
                    return Err(UdsError::Negative { service, nrc });
                }
                Reply::Negative { service, .. } => {
                    return Err(UdsError::UnexpectedService {
                        expected: request.service,
                        got: service,
                    });
                }
                Reply::Positive(response) if response.service != request.service => {
                    return Err(UdsError::UnexpectedService {
                        expected: request.service,
                        got: response.service,
                    });
                }
                Reply::Positive(response) => return Ok(Some(response)),
            }
        }
    }

    async fn expect_response(&mut self, request: &Request) -> Result<Response, UdsError> {
        self.send_request(request, false, None)
            .await?
            .ok_or(UdsError::MalformedResponse {
                service: request.service,
                reason: "no response",
            })
    }

    /// Write `data` as is. With a timeout, wait that long for one payload back.
    pub async fn send_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, UdsError> {
        let write_timeout = timeout.unwrap_or(self.config.request_timeout);
        self.writer
            .write_with(data, Instant::now() + write_timeout, &self.cancel)
            .await?;
        let Some(timeout) = timeout else {
            return Ok(None);
        };
        let received = self
            .reader
            .read_with(Instant::now() + timeout, &self.cancel)
            .await?;
        Ok(Some(received.payload))
    }

    /// DiagnosticSessionControl (0x10).
    pub async fn change_session(
        &mut self,
        session: u8,
        suppress_positive_response: bool,
    ) -> Result<Option<Response>, UdsError> {
        let request = Request::new(sid::DIAGNOSTIC_SESSION_CONTROL).with_subfunction(session);
        let response = self
            .send_request(&request, suppress_positive_response, None)
            .await?;
        if let Some(rsp) = &response {
            rsp.echo_u8("session", session)?;
        }
        Ok(response)
    }

    /// ECUReset (0x11).
    pub async fn ecu_reset(
        &mut self,
        reset_type: u8,
        suppress_positive_response: bool,
    ) -> Result<Option<Response>, UdsError> {
        let request = Request::new(sid::ECU_RESET).with_subfunction(reset_type);
        let response = self
            .send_request(&request, suppress_positive_response, None)
            .await?;
        if let Some(rsp) = &response {
            rsp.echo_u8("reset type", reset_type)?;
        }
        Ok(response)
    }

    /// ClearDiagnosticInformation (0x14) for a 24-bit DTC group; `0xFFFFFF` clears all.
    pub async fn clear_dtc(&mut self, group: u32) -> Result<(), UdsError> {
        if group > 0xFF_FFFF {
            return Err(UdsError::InvalidRequest("DTC group is 24 bits"));
        }
        let request =
            Request::new(sid::CLEAR_DIAGNOSTIC_INFORMATION).with_data(&group.to_be_bytes()[1..]);
        self.expect_response(&request).await?;
        Ok(())
    }

    async fn read_dtc_information(
        &mut self,
        report: u8,
        status_mask: Option<u8>,
    ) -> Result<Response, UdsError> {
        let mut request = Request::new(sid::READ_DTC_INFORMATION).with_subfunction(report);
        if let Some(mask) = status_mask {
            request = request.with_data(&[mask]);
        }
        let response = self.expect_response(&request).await?;
        response.echo_u8("report type", report)?;
        Ok(response)
    }

    /// ReadDTCInformation reportNumberOfDTCByStatusMask (0x19 0x01).
    pub async fn get_number_of_dtc_by_status_mask(
        &mut self,
        status_mask: u8,
    ) -> Result<DtcCount, UdsError> {
        let rsp = self
            .read_dtc_information(dtc_report::NUMBER_BY_STATUS_MASK, Some(status_mask))
            .await?;
        DtcCount::parse(&rsp)
    }

    /// ReadDTCInformation reportDTCByStatusMask (0x19 0x02).
    pub async fn get_dtc_by_status_mask(&mut self, status_mask: u8) -> Result<DtcReport, UdsError> {
        let rsp = self
            .read_dtc_information(dtc_report::BY_STATUS_MASK, Some(status_mask))
            .await?;
        DtcReport::parse(&rsp)
    }

    /// ReadDTCInformation reportSupportedDTC (0x19 0x0A).
    pub async fn get_supported_dtc(&mut self) -> Result<DtcReport, UdsError> {
        let rsp = self
            .read_dtc_information(dtc_report::SUPPORTED, None)
            .await?;
        DtcReport::parse(&rsp)
    }

    /// ReadDataByIdentifier (0x22) for one identifier; returns its record.
    pub async fn read_data_by_identifier(&mut self, did: u16) -> Result<Vec<u8>, UdsError> {
        let request = Request::new(sid::READ_DATA_BY_IDENTIFIER).with_data(&did.to_be_bytes());
        let response = self.expect_response(&request).await?;
        response.echo_u16("data identifier", 0, did)?;
        Ok(response.data[2..].to_vec())
    }

    /// ReadDataByIdentifier (0x22) for several identifiers at once.
    ///
    /// Every identifier needs a record length in [`UdsConfig::did_lengths`].
    pub async fn read_data_by_identifiers(
        &mut self,
        dids: &[u16],
    ) -> Result<Vec<(u16, Vec<u8>)>, UdsError> {
        if dids.is_empty() {
            return Err(UdsError::InvalidRequest("no data identifier given"));
        }
        if dids.iter().any(|did| !self.config.did_lengths.contains_key(did)) {
            return Err(UdsError::InvalidRequest(
                "no record length configured for data identifier",
            ));
        }
        let data: Vec<u8> = dids.iter().flat_map(|d| d.to_be_bytes()).collect();
        let request = Request::new(sid::READ_DATA_BY_IDENTIFIER).with_data(&data);
        let response = self.expect_response(&request).await?;
        split_records(&response, dids, &self.config)
    }

    /// WriteDataByIdentifier (0x2E).
    pub async fn write_data_by_identifier(&mut self, did: u16, value: &[u8]) -> Result<(), UdsError> {
        let request = Request::new(sid::WRITE_DATA_BY_IDENTIFIER)
            .with_data(&did.to_be_bytes())
            .with_data(value);
        let response = self.expect_response(&request).await?;
        response.echo_u16("data identifier", 0, did)
    }

    /// SecurityAccess requestSeed (0x27, odd level). Returns the seed.
    pub async fn request_seed(&mut self, level: u8) -> Result<Vec<u8>, UdsError> {
        let level = seed_level(level);
        let request = Request::new(sid::SECURITY_ACCESS).with_subfunction(level);
        let response = self.expect_response(&request).await?;
        response.echo_u8("security level", level)?;
        Ok(response.data[1..].to_vec())
    }

    /// SecurityAccess sendKey (0x27, even level).
    pub async fn send_key(&mut self, level: u8, key: &[u8]) -> Result<(), UdsError> {
        let level = key_level(level);
        let request = Request::new(sid::SECURITY_ACCESS)
            .with_subfunction(level)
            .with_data(key);
        let response = self.expect_response(&request).await?;
        response.echo_u8("security level", level)
    }

    /// CommunicationControl (0x28).
    pub async fn communication_control(
        &mut self,
        control_type: u8,
        communication_type: u8,
        suppress_positive_response: bool,
    ) -> Result<Option<Response>, UdsError> {
        let request = Request::new(sid::COMMUNICATION_CONTROL)
            .with_subfunction(control_type)
            .with_data(&[communication_type]);
        let response = self
            .send_request(&request, suppress_positive_response, None)
            .await?;
        if let Some(rsp) = &response {
            rsp.echo_u8("control type", control_type)?;
        }
        Ok(response)
    }

    /// RoutineControl (0x31). Returns the routine status record.
    pub async fn routine_control(
        &mut self,
        routine_id: u16,
        control_type: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let request = Request::new(sid::ROUTINE_CONTROL)
            .with_subfunction(control_type)
            .with_data(&routine_id.to_be_bytes())
            .with_data(data);
        let response = self.expect_response(&request).await?;
        response.echo_u8("control type", control_type)?;
        response.echo_u16("routine identifier", 1, routine_id)?;
        Ok(response.data[3..].to_vec())
    }

    pub async fn start_routine(&mut self, routine_id: u16, data: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.routine_control(routine_id, routine::START, data).await
    }

    pub async fn stop_routine(&mut self, routine_id: u16, data: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.routine_control(routine_id, routine::STOP, data).await
    }

    pub async fn get_routine_result(&mut self, routine_id: u16) -> Result<Vec<u8>, UdsError> {
        self.routine_control(routine_id, routine::REQUEST_RESULTS, &[])
            .await
    }

    async fn request_transfer(
        &mut self,
        service: u8,
        location: &MemoryLocation,
        data_format: u8,
    ) -> Result<u64, UdsError> {
        let request = Request::new(service)
            .with_data(&[data_format])
            .with_data(&location.encode());
        let response = self.expect_response(&request).await?;
        parse_max_block_length(&response)
    }

    /// RequestDownload (0x34). Returns maxNumberOfBlockLength.
    pub async fn request_download(
        &mut self,
        location: &MemoryLocation,
        data_format: u8,
    ) -> Result<u64, UdsError> {
        self.request_transfer(sid::REQUEST_DOWNLOAD, location, data_format)
            .await
    }

    /// RequestUpload (0x35). Returns maxNumberOfBlockLength.
    pub async fn request_upload(
        &mut self,
        location: &MemoryLocation,
        data_format: u8,
    ) -> Result<u64, UdsError> {
        self.request_transfer(sid::REQUEST_UPLOAD, location, data_format)
            .await
    }

    /// TransferData (0x36). Returns the response parameters after the counter echo.
    pub async fn transfer_data(&mut self, block_counter: u8, data: &[u8]) -> Result<Vec<u8>, UdsError> {
        let request = Request::new(sid::TRANSFER_DATA)
            .with_data(&[block_counter])
            .with_data(data);
        let response = self.expect_response(&request).await?;
        response.echo_u8("block sequence counter", block_counter)?;
        Ok(response.data[1..].to_vec())
    }

    /// RequestTransferExit (0x37).
    pub async fn request_transfer_exit(&mut self, data: &[u8]) -> Result<Vec<u8>, UdsError> {
        let request = Request::new(sid::REQUEST_TRANSFER_EXIT).with_data(data);
        let response = self.expect_response(&request).await?;
        Ok(response.data)
    }

    /// TesterPresent (0x3E).
    pub async fn tester_present(
        &mut self,
        suppress_positive_response: bool,
    ) -> Result<Option<Response>, UdsError> {
        let request = Request::new(sid::TESTER_PRESENT).with_subfunction(0x00);
        let response = self
            .send_request(&request, suppress_positive_response, None)
            .await?;
        if let Some(rsp) = &response {
            rsp.echo_u8("sub-function", 0x00)?;
        }
        Ok(response)
    }

    /// ControlDTCSetting (0x85).
    pub async fn control_dtc_setting(
        &mut self,
        setting_type: u8,
        data: &[u8],
        suppress_positive_response: bool,
    ) -> Result<Option<Response>, UdsError> {
        let request = Request::new(sid::CONTROL_DTC_SETTING)
            .with_subfunction(setting_type)
            .with_data(data);
        let response = self
            .send_request(&request, suppress_positive_response, None)
            .await?;
        if let Some(rsp) = &response {
            rsp.echo_u8("setting type", setting_type)?;
        }
        Ok(response)
    }
}

fn split_records(
    response: &Response,
    dids: &[u16],
    config: &UdsConfig,
) -> Result<Vec<(u16, Vec<u8>)>, UdsError> {
    let data = &response.data;
    let mut records = Vec::with_capacity(dids.len());
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        if config.tolerate_zero_padding && rest.iter().all(|&b| b == 0) {
            break;
        }
        if rest.len() < 2 {
            return Err(UdsError::MalformedResponse {
                service: response.service,
                reason: "truncated data identifier",
            });
        }
        let did = u16::from_be_bytes([rest[0], rest[1]]);
        let len = match config.did_lengths.get(&did) {
            Some(&len) if dids.contains(&did) => len,
            _ => return Err(UdsError::UnexpectedDataIdentifier(did)),
        };
        let Some(record) = rest.get(2..2 + len) else {
            return Err(UdsError::MalformedResponse {
                service: response.service,
                reason: "truncated data record",
            });
        };
        records.push((did, record.to_vec()));
        offset += 2 + len;
    }
    if let Some(&missing) = dids
        .iter()
        .find(|did| !records.iter().any(|(got, _)| got == *did))
    {
        return Err(UdsError::MissingDataIdentifier(missing));
    }
    Ok(records)
}
