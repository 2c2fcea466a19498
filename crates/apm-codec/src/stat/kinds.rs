// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::{DecodeError, EncodeError};

use super::strategy::{FieldDecoder, FieldEncoder};
use super::{AgentStatType, AgentStatValue};

/// Marker used by agents for values they could not collect.
pub const UNCOLLECTED: i64 = -1;

const CPU_LOAD_SCALE: f64 = 1000.0;

fn narrow<T: TryFrom<i64>>(value: i64, field: &str) -> Result<T, DecodeError> {
    T::try_from(value).map_err(|_| DecodeError::InvalidFormat(format!("{field} {value} out of range")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i64)]
pub enum JvmGcType {
    #[default]
    Unknown = 0,
    Serial = 1,
    Parallel = 2,
    Cms = 3,
    G1 = 4,
}

impl JvmGcType {
    #[must_use]
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(JvmGcType::Unknown),
            1 => Ok(JvmGcType::Serial),
            2 => Ok(JvmGcType::Parallel),
            3 => Ok(JvmGcType::Cms),
            4 => Ok(JvmGcType::G1),
            other => Err(DecodeError::InvalidType(format!("jvm gc type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JvmGc {
    pub gc_type: JvmGcType,
    pub heap_used: i64,
    pub heap_max: i64,
    pub non_heap_used: i64,
    pub non_heap_max: i64,
    pub gc_old_count: i64,
    pub gc_old_time: i64,
}

impl AgentStatValue for JvmGc {
    const STAT_TYPE: AgentStatType = AgentStatType::JvmGc;

    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError> {
        let gc_types: Vec<i64> = values.iter().map(|v| v.gc_type.code()).collect();
        encoder.unsigned_longs(&gc_types)?;
        let fields: [fn(&JvmGc) -> i64; 6] = [
            |v| v.heap_used,
            |v| v.heap_max,
            |v| v.non_heap_used,
            |v| v.non_heap_max,
            |v| v.gc_old_count,
            |v| v.gc_old_time,
        ];
        for field in fields {
            let column: Vec<i64> = values.iter().map(|v| field(v)).collect();
            encoder.signed_longs(&column)?;
        }
        Ok(())
    }

    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError> {
        let gc_types = decoder.unsigned_longs()?;
        let heap_used = decoder.signed_longs()?;
        let heap_max = decoder.signed_longs()?;
        let non_heap_used = decoder.signed_longs()?;
        let non_heap_max = decoder.signed_longs()?;
        let gc_old_count = decoder.signed_longs()?;
        let gc_old_time = decoder.signed_longs()?;
        (0..decoder.count())
            .map(|i| {
                Ok(JvmGc {
                    gc_type: JvmGcType::from_code(gc_types[i])?,
                    heap_used: heap_used[i],
                    heap_max: heap_max[i],
                    non_heap_used: non_heap_used[i],
                    non_heap_max: non_heap_max[i],
                    gc_old_count: gc_old_count[i],
                    gc_old_time: gc_old_time[i],
                })
            })
            .collect()
    }
}

/// CPU load ratios. Values travel as integers in thousandths, so a decoded load is the original
/// rounded to three decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuLoad {
    pub jvm_cpu_load: f64,
    pub system_cpu_load: f64,
}

fn quantize(load: f64) -> i64 {
    (load * CPU_LOAD_SCALE).round() as i64
}

fn dequantize(value: i64) -> f64 {
    value as f64 / CPU_LOAD_SCALE
}

impl AgentStatValue for CpuLoad {
    const STAT_TYPE: AgentStatType = AgentStatType::CpuLoad;

    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError> {
        let jvm: Vec<i64> = values.iter().map(|v| quantize(v.jvm_cpu_load)).collect();
        let system: Vec<i64> = values.iter().map(|v| quantize(v.system_cpu_load)).collect();
        encoder.signed_longs(&jvm)?;
        encoder.signed_longs(&system)?;
        Ok(())
    }

    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError> {
        let jvm = decoder.signed_longs()?;
        let system = decoder.signed_longs()?;
        Ok(jvm
            .into_iter()
            .zip(system)
            .map(|(jvm, system)| CpuLoad {
                jvm_cpu_load: dequantize(jvm),
                system_cpu_load: dequantize(system),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TotalThreadCount {
    pub total_thread_count: i64,
}

impl AgentStatValue for TotalThreadCount {
    const STAT_TYPE: AgentStatType = AgentStatType::TotalThreadCount;

    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError> {
        let counts: Vec<i64> = values.iter().map(|v| v.total_thread_count).collect();
        encoder.signed_longs(&counts)?;
        Ok(())
    }

    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError> {
        let counts = decoder.signed_longs()?;
        Ok(counts
            .into_iter()
            .map(|total_thread_count| TotalThreadCount { total_thread_count })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileDescriptor {
    pub open_file_descriptor_count: i64,
}

impl AgentStatValue for FileDescriptor {
    const STAT_TYPE: AgentStatType = AgentStatType::FileDescriptor;

    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError> {
        let counts: Vec<i64> = values
            .iter()
            .map(|v| v.open_file_descriptor_count)
            .collect();
        encoder.signed_longs(&counts)?;
        Ok(())
    }

    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError> {
        let counts = decoder.signed_longs()?;
        Ok(counts
            .into_iter()
            .map(|open_file_descriptor_count| FileDescriptor {
                open_file_descriptor_count,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadedClass {
    pub loaded_class_count: i64,
    pub unloaded_class_count: i64,
}

impl AgentStatValue for LoadedClass {
    const STAT_TYPE: AgentStatType = AgentStatType::LoadedClass;

    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError> {
        let loaded: Vec<i64> = values.iter().map(|v| v.loaded_class_count).collect();
        let unloaded: Vec<i64> = values.iter().map(|v| v.unloaded_class_count).collect();
        encoder.signed_longs(&loaded)?;
        encoder.signed_longs(&unloaded)?;
        Ok(())
    }

    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError> {
        let loaded = decoder.signed_longs()?;
        let unloaded = decoder.signed_longs()?;
        Ok(loaded
            .into_iter()
            .zip(unloaded)
            .map(|(loaded_class_count, unloaded_class_count)| LoadedClass {
                loaded_class_count,
                unloaded_class_count,
            })
            .collect())
    }
}

/// Connection pool usage of one data source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSource {
    pub id: i32,
    pub service_type_code: i16,
    pub database_name: Option<String>,
    pub jdbc_url: Option<String>,
    pub active_connection_size: i32,
    pub max_connection_size: i32,
}

impl AgentStatValue for DataSource {
    const STAT_TYPE: AgentStatType = AgentStatType::DataSource;

    fn encode_fields(values: &[&Self], encoder: &mut FieldEncoder) -> Result<(), EncodeError> {
        let ids: Vec<i64> = values.iter().map(|v| i64::from(v.id)).collect();
        let service_types: Vec<i64> = values
            .iter()
            .map(|v| i64::from(v.service_type_code))
            .collect();
        let names: Vec<Option<String>> = values.iter().map(|v| v.database_name.clone()).collect();
        let urls: Vec<Option<String>> = values.iter().map(|v| v.jdbc_url.clone()).collect();
        let active: Vec<i64> = values
            .iter()
            .map(|v| i64::from(v.active_connection_size))
            .collect();
        let max: Vec<i64> = values
            .iter()
            .map(|v| i64::from(v.max_connection_size))
            .collect();

        encoder.signed_longs(&ids)?;
        encoder.signed_longs(&service_types)?;
        encoder.strings(&names)?;
        encoder.strings(&urls)?;
        encoder.signed_longs(&active)?;
        encoder.signed_longs(&max)?;
        Ok(())
    }

    fn decode_fields(decoder: &mut FieldDecoder<'_, '_, '_>) -> Result<Vec<Self>, DecodeError> {
        let ids = decoder.signed_longs()?;
        let service_types = decoder.signed_longs()?;
        let names = decoder.strings()?;
        let urls = decoder.strings()?;
        let active = decoder.signed_longs()?;
        let max = decoder.signed_longs()?;
        (0..decoder.count())
            .map(|i| {
                Ok(DataSource {
                    id: narrow(ids[i], "data source id")?,
                    service_type_code: narrow(service_types[i], "data source service type")?,
                    database_name: names[i].clone(),
                    jdbc_url: urls[i].clone(),
                    active_connection_size: narrow(active[i], "active connection size")?,
                    max_connection_size: narrow(max[i], "max connection size")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_load_quantization() {
        assert_eq!(quantize(0.1234), 123);
        assert_eq!(quantize(-1.0), -1000);
        assert_eq!(dequantize(quantize(0.25)), 0.25);
        assert_eq!(dequantize(quantize(UNCOLLECTED as f64)), -1.0);
    }

    #[test]
    fn test_gc_type_codes() {
        for gc_type in [
            JvmGcType::Unknown,
            JvmGcType::Serial,
            JvmGcType::Parallel,
            JvmGcType::Cms,
            JvmGcType::G1,
        ] {
            assert_eq!(JvmGcType::from_code(gc_type.code()).unwrap(), gc_type);
        }
        assert!(JvmGcType::from_code(9).is_err());
    }

    #[test]
    fn test_narrow_rejects_out_of_range() {
        assert!(narrow::<i16>(i64::from(i16::MAX) + 1, "service type").is_err());
        assert_eq!(narrow::<i32>(-1, "id").unwrap(), -1);
    }
}
