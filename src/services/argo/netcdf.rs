//! Minimal reader for the classic NetCDF format (CDF-1 and CDF-2).
//!
//! ARGO profile files are self-describing big-endian binaries; this reader
//! exposes dimensions, attributes and raw variable data without any value
//! decoding or scaling. Fill-value interpretation belongs to the caller.

use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;
use std::path::Path;

const TAG_DIMENSION: u32 = 0x0A;
const TAG_VARIABLE: u32 = 0x0B;
const TAG_ATTRIBUTE: u32 = 0x0C;
const NUMRECS_STREAMING: u32 = 0xFFFF_FFFF;

#[derive(Debug, thiserror::Error)]
pub enum NetcdfError {
    #[error("not a classic NetCDF file")]
    NotNetcdf,
    #[error("unsupported NetCDF version byte {0}")]
    UnsupportedVersion(u8),
    #[error("file truncated at offset {0}")]
    Truncated(usize),
    #[error("malformed header: {0}")]
    Malformed(&'static str),
    #[error("variable {name} holds {actual:?} data, not {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: NcType,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
}

impl NcType {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(NcType::Byte),
            2 => Some(NcType::Char),
            3 => Some(NcType::Short),
            4 => Some(NcType::Int),
            5 => Some(NcType::Float),
            6 => Some(NcType::Double),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            NcType::Byte | NcType::Char => 1,
            NcType::Short => 2,
            NcType::Int | NcType::Float => 4,
            NcType::Double => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Bytes(Vec<i8>),
    Shorts(Vec<i16>),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
}

impl AttrValue {
    /// First element widened to f64, for numeric attributes like `_FillValue`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Bytes(v) => v.first().map(|x| *x as f64),
            AttrValue::Shorts(v) => v.first().map(|x| *x as f64),
            AttrValue::Ints(v) => v.first().map(|x| *x as f64),
            AttrValue::Floats(v) => v.first().map(|x| *x as f64),
            AttrValue::Doubles(v) => v.first().copied(),
            AttrValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
    pub is_record: bool,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub dim_ids: Vec<usize>,
    pub attrs: BTreeMap<String, AttrValue>,
    pub nc_type: NcType,
    begin: u64,
    is_record: bool,
    /// Elements per record for record variables, total elements otherwise.
    slab_elements: usize,
}

impl Variable {
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn fill_value(&self) -> Option<f64> {
        self.attr("_FillValue").and_then(AttrValue::as_f64)
    }
}

#[derive(Debug)]
pub struct NetcdfFile {
    data: Vec<u8>,
    pub num_records: usize,
    dims: Vec<Dimension>,
    pub attrs: BTreeMap<String, AttrValue>,
    vars: Vec<Variable>,
    record_stride: u64,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], NetcdfError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(NetcdfError::Truncated(self.pos))?;
        if end > self.data.len() {
            return Err(NetcdfError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, NetcdfError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn read_u64(&mut self) -> Result<u64, NetcdfError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    /// Counted string padded to a four-byte boundary.
    fn read_name(&mut self) -> Result<String, NetcdfError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let name = String::from_utf8_lossy(bytes).into_owned();
        self.skip_padding(len)?;
        Ok(name)
    }

    fn skip_padding(&mut self, consumed: usize) -> Result<(), NetcdfError> {
        let rem = consumed % 4;
        if rem != 0 {
            self.take(4 - rem)?;
        }
        Ok(())
    }

    fn read_attr_values(&mut self, nc_type: NcType, n: usize) -> Result<AttrValue, NetcdfError> {
        let raw = self.take(n * nc_type.size())?;
        let value = match nc_type {
            NcType::Char => {
                AttrValue::Text(String::from_utf8_lossy(raw).trim_end_matches('\0').to_string())
            }
            NcType::Byte => AttrValue::Bytes(raw.iter().map(|b| *b as i8).collect()),
            NcType::Short => {
                AttrValue::Shorts((0..n).map(|i| BigEndian::read_i16(&raw[i * 2..])).collect())
            }
            NcType::Int => {
                AttrValue::Ints((0..n).map(|i| BigEndian::read_i32(&raw[i * 4..])).collect())
            }
            NcType::Float => {
                AttrValue::Floats((0..n).map(|i| BigEndian::read_f32(&raw[i * 4..])).collect())
            }
            NcType::Double => {
                AttrValue::Doubles((0..n).map(|i| BigEndian::read_f64(&raw[i * 8..])).collect())
            }
        };
        self.skip_padding(n * nc_type.size())?;
        Ok(value)
    }

    fn read_attr_map(&mut self) -> Result<BTreeMap<String, AttrValue>, NetcdfError> {
        let tag = self.read_u32()?;
        let nelems = self.read_u32()? as usize;
        if tag == 0 && nelems == 0 {
            return Ok(BTreeMap::new());
        }
        if tag != TAG_ATTRIBUTE {
            return Err(NetcdfError::Malformed("expected attribute list tag"));
        }
        let mut attrs = BTreeMap::new();
        for _ in 0..nelems {
            let name = self.read_name()?;
            let type_code = self.read_u32()?;
            let nc_type = NcType::from_code(type_code)
                .ok_or(NetcdfError::Malformed("unknown attribute type"))?;
            let count = self.read_u32()? as usize;
            let value = self.read_attr_values(nc_type, count)?;
            attrs.insert(name, value);
        }
        Ok(attrs)
    }
}

impl NetcdfFile {
    pub fn open(path: &Path) -> Result<Self, NetcdfError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, NetcdfError> {
        if data.len() < 4 || &data[0..3] != b"CDF" {
            return Err(NetcdfError::NotNetcdf);
        }
        let version = data[3];
        if version != 1 && version != 2 {
            return Err(NetcdfError::UnsupportedVersion(version));
        }

        let mut cursor = Cursor {
            data: &data,
            pos: 4,
        };
        let numrecs_raw = cursor.read_u32()?;

        // Dimension list.
        let tag = cursor.read_u32()?;
        let ndims = cursor.read_u32()? as usize;
        if !(tag == TAG_DIMENSION || (tag == 0 && ndims == 0)) {
            return Err(NetcdfError::Malformed("expected dimension list tag"));
        }
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            let name = cursor.read_name()?;
            let len = cursor.read_u32()? as usize;
            dims.push(Dimension {
                name,
                len,
                is_record: len == 0,
            });
        }

        let attrs = cursor.read_attr_map()?;

        // Variable list.
        let tag = cursor.read_u32()?;
        let nvars = cursor.read_u32()? as usize;
        if !(tag == TAG_VARIABLE || (tag == 0 && nvars == 0)) {
            return Err(NetcdfError::Malformed("expected variable list tag"));
        }
        let mut vars = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            let name = cursor.read_name()?;
            let rank = cursor.read_u32()? as usize;
            let mut dim_ids = Vec::with_capacity(rank);
            for _ in 0..rank {
                let id = cursor.read_u32()? as usize;
                if id >= dims.len() {
                    return Err(NetcdfError::Malformed("dimension id out of range"));
                }
                dim_ids.push(id);
            }
            let var_attrs = cursor.read_attr_map()?;
            let type_code = cursor.read_u32()?;
            let nc_type = NcType::from_code(type_code)
                .ok_or(NetcdfError::Malformed("unknown variable type"))?;
            let _vsize = cursor.read_u32()?;
            let begin = if version == 1 {
                cursor.read_u32()? as u64
            } else {
                cursor.read_u64()?
            };

            let is_record = dim_ids.first().map(|id| dims[*id].is_record).unwrap_or(false);
            let slab_elements = dim_ids
                .iter()
                .skip(if is_record { 1 } else { 0 })
                .map(|id| dims[*id].len)
                .product::<usize>();
            vars.push(Variable {
                name,
                dim_ids,
                attrs: var_attrs,
                nc_type,
                begin,
                is_record,
                slab_elements,
            });
        }

        let record_vars: Vec<&Variable> = vars.iter().filter(|v| v.is_record).collect();
        let record_stride: u64 = if record_vars.len() == 1 {
            // A lone record variable's slabs are not padded.
            (record_vars[0].slab_elements * record_vars[0].nc_type.size()) as u64
        } else {
            record_vars
                .iter()
                .map(|v| pad4(v.slab_elements * v.nc_type.size()) as u64)
                .sum()
        };

        let num_records = if numrecs_raw == NUMRECS_STREAMING {
            // Streaming files leave numrecs unset; derive it from the tail.
            match (record_stride, record_vars.iter().map(|v| v.begin).min()) {
                (stride, Some(first)) if stride > 0 => {
                    ((data.len() as u64).saturating_sub(first) / stride) as usize
                }
                _ => 0,
            }
        } else {
            numrecs_raw as usize
        };

        Ok(Self {
            data,
            num_records,
            dims,
            attrs,
            vars,
            record_stride,
        })
    }

    pub fn dimension_len(&self, name: &str) -> Option<usize> {
        self.dims.iter().find(|d| d.name == name).map(|d| {
            if d.is_record {
                self.num_records
            } else {
                d.len
            }
        })
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.vars.iter().map(|v| v.name.as_str()).collect()
    }

    /// Shape with the record dimension resolved to the record count.
    pub fn shape(&self, var: &Variable) -> Vec<usize> {
        var.dim_ids
            .iter()
            .map(|id| {
                let dim = &self.dims[*id];
                if dim.is_record {
                    self.num_records
                } else {
                    dim.len
                }
            })
            .collect()
    }

    fn element_count(&self, var: &Variable) -> usize {
        if var.is_record {
            var.slab_elements * self.num_records
        } else {
            var.slab_elements
        }
    }

    fn raw_slabs(&self, var: &Variable) -> Result<Vec<&[u8]>, NetcdfError> {
        let slab_bytes = var.slab_elements * var.nc_type.size();
        let mut slabs = Vec::new();
        if var.is_record {
            for record in 0..self.num_records {
                let start = var.begin + record as u64 * self.record_stride;
                let start = start as usize;
                let end = start + slab_bytes;
                if end > self.data.len() {
                    return Err(NetcdfError::Truncated(start));
                }
                slabs.push(&self.data[start..end]);
            }
        } else {
            let start = var.begin as usize;
            let end = start + slab_bytes;
            if end > self.data.len() {
                return Err(NetcdfError::Truncated(start));
            }
            slabs.push(&self.data[start..end]);
        }
        Ok(slabs)
    }

    /// All values of a numeric variable widened to f64, row-major.
    pub fn read_doubles(&self, var: &Variable) -> Result<Vec<f64>, NetcdfError> {
        if var.nc_type == NcType::Char {
            return Err(NetcdfError::TypeMismatch {
                name: var.name.clone(),
                expected: "numeric",
                actual: var.nc_type,
            });
        }
        let mut out = Vec::with_capacity(self.element_count(var));
        for slab in self.raw_slabs(var)? {
            match var.nc_type {
                NcType::Byte => out.extend(slab.iter().map(|b| *b as i8 as f64)),
                NcType::Short => {
                    out.extend(slab.chunks_exact(2).map(|c| BigEndian::read_i16(c) as f64))
                }
                NcType::Int => {
                    out.extend(slab.chunks_exact(4).map(|c| BigEndian::read_i32(c) as f64))
                }
                NcType::Float => {
                    out.extend(slab.chunks_exact(4).map(|c| BigEndian::read_f32(c) as f64))
                }
                NcType::Double => out.extend(slab.chunks_exact(8).map(BigEndian::read_f64)),
                NcType::Char => unreachable!(),
            }
        }
        Ok(out)
    }

    /// All values of an integer variable, row-major.
    pub fn read_ints(&self, var: &Variable) -> Result<Vec<i64>, NetcdfError> {
        match var.nc_type {
            NcType::Byte | NcType::Short | NcType::Int => {}
            _ => {
                return Err(NetcdfError::TypeMismatch {
                    name: var.name.clone(),
                    expected: "integer",
                    actual: var.nc_type,
                })
            }
        }
        let mut out = Vec::with_capacity(self.element_count(var));
        for slab in self.raw_slabs(var)? {
            match var.nc_type {
                NcType::Byte => out.extend(slab.iter().map(|b| *b as i8 as i64)),
                NcType::Short => {
                    out.extend(slab.chunks_exact(2).map(|c| BigEndian::read_i16(c) as i64))
                }
                NcType::Int => {
                    out.extend(slab.chunks_exact(4).map(|c| BigEndian::read_i32(c) as i64))
                }
                _ => unreachable!(),
            }
        }
        Ok(out)
    }

    /// Raw bytes of a char variable, row-major.
    pub fn read_chars(&self, var: &Variable) -> Result<Vec<u8>, NetcdfError> {
        if var.nc_type != NcType::Char && var.nc_type != NcType::Byte {
            return Err(NetcdfError::TypeMismatch {
                name: var.name.clone(),
                expected: "char",
                actual: var.nc_type,
            });
        }
        let mut out = Vec::with_capacity(self.element_count(var));
        for slab in self.raw_slabs(var)? {
            out.extend_from_slice(slab);
        }
        Ok(out)
    }
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::netcdf_fixture::NetcdfBuilder;

    #[test]
    fn rejects_non_netcdf_bytes() {
        let err = NetcdfFile::from_bytes(b"HDF\x01garbage".to_vec()).unwrap_err();
        assert!(matches!(err, NetcdfError::NotNetcdf));
    }

    #[test]
    fn rejects_cdf5() {
        let err = NetcdfFile::from_bytes(b"CDF\x05\0\0\0\0".to_vec()).unwrap_err();
        assert!(matches!(err, NetcdfError::UnsupportedVersion(5)));
    }

    #[test]
    fn reads_dimensions_variables_and_attributes() {
        let bytes = NetcdfBuilder::new()
            .dimension("N_PROF", 2)
            .dimension("N_LEVELS", 3)
            .global_text_attr("title", "Argo float vertical profile")
            .float_var(
                "TEMP",
                &["N_PROF", "N_LEVELS"],
                Some(99999.0),
                &[10.0, 11.0, 12.0, 20.0, 21.0, 99999.0],
            )
            .build();
        let file = NetcdfFile::from_bytes(bytes).unwrap();

        assert_eq!(file.dimension_len("N_PROF"), Some(2));
        assert_eq!(file.dimension_len("N_LEVELS"), Some(3));
        assert_eq!(
            file.attrs.get("title").and_then(AttrValue::as_text),
            Some("Argo float vertical profile")
        );

        let temp = file.variable("TEMP").expect("TEMP variable");
        assert_eq!(file.shape(temp), vec![2, 3]);
        assert_eq!(temp.fill_value(), Some(99999.0));

        let values = file.read_doubles(temp).unwrap();
        assert_eq!(values.len(), 6);
        assert!((values[0] - 10.0).abs() < 1e-6);
        assert!((values[5] - 99999.0).abs() < 1e-3);
    }

    #[test]
    fn reads_char_and_int_variables() {
        let bytes = NetcdfBuilder::new()
            .dimension("N_PROF", 1)
            .dimension("STRING8", 8)
            .char_var("PLATFORM_NUMBER", &["N_PROF", "STRING8"], b"2902746 ")
            .int_var("CYCLE_NUMBER", &["N_PROF"], &[42])
            .build();
        let file = NetcdfFile::from_bytes(bytes).unwrap();

        let platform = file.variable("PLATFORM_NUMBER").unwrap();
        assert_eq!(file.read_chars(platform).unwrap(), b"2902746 ".to_vec());

        let cycle = file.variable("CYCLE_NUMBER").unwrap();
        assert_eq!(file.read_ints(cycle).unwrap(), vec![42]);
    }

    #[test]
    fn char_variable_refuses_numeric_read() {
        let bytes = NetcdfBuilder::new()
            .dimension("STRING4", 4)
            .char_var("NAME", &["STRING4"], b"abcd")
            .build();
        let file = NetcdfFile::from_bytes(bytes).unwrap();
        let var = file.variable("NAME").unwrap();
        assert!(matches!(
            file.read_doubles(var),
            Err(NetcdfError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn truncated_data_section_is_detected() {
        let mut bytes = NetcdfBuilder::new()
            .dimension("N_PROF", 4)
            .double_var("JULD", &["N_PROF"], None, &[1.0, 2.0, 3.0, 4.0])
            .build();
        bytes.truncate(bytes.len() - 8);
        let file = NetcdfFile::from_bytes(bytes).unwrap();
        let juld = file.variable("JULD").unwrap();
        assert!(matches!(
            file.read_doubles(juld),
            Err(NetcdfError::Truncated(_))
        ));
    }
}
