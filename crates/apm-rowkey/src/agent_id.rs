// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keys of the application/agent index.
//!
//! ```text
//! | service uid (4) | application name (254) | service type (4) | agent id (24) | inverted start (8) |
//! ```
//!
//! Every prefix of the full key is itself a valid scan prefix: all agents of an application, all
//! agents of one service type, or every incarnation of one agent, most recent first.

use apm_codec::message::AgentInfo;
use apm_codec::{ReadBuffer, WriteBuffer};

use crate::errors::RowKeyError;
use crate::time;

pub const APPLICATION_NAME_MAX_LEN: usize = 254;
pub const AGENT_ID_MAX_LEN: usize = 24;

pub const APPLICATION_PREFIX_LEN: usize = 4 + APPLICATION_NAME_MAX_LEN;
pub const SERVICE_TYPE_PREFIX_LEN: usize = APPLICATION_PREFIX_LEN + 4;
pub const AGENT_PREFIX_LEN: usize = SERVICE_TYPE_PREFIX_LEN + AGENT_ID_MAX_LEN;
pub const ROW_KEY_LEN: usize = AGENT_PREFIX_LEN + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdRowKey {
    pub service_uid: i32,
    pub application_name: String,
    pub service_type_code: i32,
    pub agent_id: String,
    pub agent_start_time: i64,
}

impl AgentIdRowKey {
    pub fn from_agent_info(service_uid: i32, info: &AgentInfo) -> Self {
        AgentIdRowKey {
            service_uid,
            application_name: info.application_name.clone(),
            service_type_code: i32::from(info.service_type_code),
            agent_id: info.agent_id.clone(),
            agent_start_time: info.agent_start_time,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RowKeyError> {
        let mut buf = WriteBuffer::with_capacity(ROW_KEY_LEN);
        write_agent_prefix(
            &mut buf,
            self.service_uid,
            &self.application_name,
            self.service_type_code,
            &self.agent_id,
        )?;
        buf.put_bytes(&time::inverted_bytes(self.agent_start_time)?);
        Ok(buf.into_vec())
    }

    pub fn decode(key: &[u8]) -> Result<Self, RowKeyError> {
        if key.len() != ROW_KEY_LEN {
            return Err(RowKeyError::InvalidKeyLength {
                expected: ROW_KEY_LEN,
                actual: key.len(),
            });
        }
        let mut buf = ReadBuffer::new(key);
        let service_uid = buf.read_i32()?;
        let application_name = buf.read_pad_string_and_right_trim(APPLICATION_NAME_MAX_LEN)?;
        let service_type_code = buf.read_i32()?;
        let agent_id = buf.read_pad_string_and_right_trim(AGENT_ID_MAX_LEN)?;
        let agent_start_time = time::restore(buf.read_i64()?)?;
        Ok(AgentIdRowKey {
            service_uid,
            application_name,
            service_type_code,
            agent_id,
            agent_start_time,
        })
    }
}

fn write_application_prefix(
    buf: &mut WriteBuffer,
    service_uid: i32,
    application_name: &str,
) -> Result<(), RowKeyError> {
    buf.put_i32(service_uid);
    buf.put_pad_string(application_name, APPLICATION_NAME_MAX_LEN)?;
    Ok(())
}

fn write_agent_prefix(
    buf: &mut WriteBuffer,
    service_uid: i32,
    application_name: &str,
    service_type_code: i32,
    agent_id: &str,
) -> Result<(), RowKeyError> {
    write_application_prefix(buf, service_uid, application_name)?;
    buf.put_i32(service_type_code);
    buf.put_pad_string(agent_id, AGENT_ID_MAX_LEN)?;
    Ok(())
}

/// Scan prefix for every agent of an application.
pub fn application_prefix(service_uid: i32, application_name: &str) -> Result<Vec<u8>, RowKeyError> {
    let mut buf = WriteBuffer::with_capacity(APPLICATION_PREFIX_LEN);
    write_application_prefix(&mut buf, service_uid, application_name)?;
    Ok(buf.into_vec())
}

/// Scan prefix for the agents of an application running as one service type.
pub fn service_type_prefix(
    service_uid: i32,
    application_name: &str,
    service_type_code: i32,
) -> Result<Vec<u8>, RowKeyError> {
    let mut buf = WriteBuffer::with_capacity(SERVICE_TYPE_PREFIX_LEN);
    write_application_prefix(&mut buf, service_uid, application_name)?;
    buf.put_i32(service_type_code);
    Ok(buf.into_vec())
}

/// Scan prefix for every start of one agent.
pub fn agent_prefix(
    service_uid: i32,
    application_name: &str,
    service_type_code: i32,
    agent_id: &str,
) -> Result<Vec<u8>, RowKeyError> {
    let mut buf = WriteBuffer::with_capacity(AGENT_PREFIX_LEN);
    write_agent_prefix(&mut buf, service_uid, application_name, service_type_code, agent_id)?;
    Ok(buf.into_vec())
}
