use anyhow::{Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

const I16_MAX_F: f32 = 32768.0; // 2^15
const I24_MAX_F: f32 = 8388608.0; // 2^23
const I32_MAX_F: f32 = 2147483648.0; // 2^31

const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Holds format information from the 'fmt ' chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFmt {
    pub audio_format: u16, // 1 = PCM, 3 = IEEE Float (extensible headers resolved)
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFmt {
    fn bytes_per_sample(&self) -> u64 {
        (self.bits_per_sample as u64).div_ceil(8)
    }

    fn block_align(&self) -> u64 {
        self.bytes_per_sample() * self.num_channels as u64
    }

    fn check_supported(&self) -> Result<()> {
        if self.num_channels == 0 {
            return Err(anyhow!("zero channels"));
        }
        match (self.audio_format, self.bits_per_sample) {
            (FORMAT_PCM, 8 | 16 | 24 | 32) | (FORMAT_IEEE_FLOAT, 32) => Ok(()),
            (format, bits) => Err(anyhow!(
                "unsupported encoding (format tag {format}, {bits} bits per sample)"
            )),
        }
    }
}

/// Walks the RIFF chunks and returns the format plus (offset, size) of the data chunk.
pub fn parse_wav_metadata<R: Read + Seek>(
    reader: &mut R,
    full_path_for_logs: &Path,
) -> Result<(WavFmt, u64, u64)> {
    let mut header = [0; 4];
    reader.read_exact(&mut header)?;
    if &header != b"RIFF" {
        return Err(anyhow!(
            "Not a RIFF file (found {:?}): {:?}",
            header,
            full_path_for_logs
        ));
    }

    let _file_size = reader.read_u32::<LittleEndian>()?;
    let mut wave_header = [0; 4];
    reader.read_exact(&mut wave_header)?;
    if &wave_header != b"WAVE" {
        return Err(anyhow!("Not a WAVE file: {:?}", full_path_for_logs));
    }

    let mut format_chunk: Option<WavFmt> = None;
    let mut data_chunk_info: Option<(u64, u64)> = None;

    while let Ok(chunk_id) = reader.read_u32::<LittleEndian>().map(|id| id.to_le_bytes()) {
        let chunk_size = reader.read_u32::<LittleEndian>()? as u64;
        let chunk_data_start_pos = reader.stream_position()?;
        let next_chunk_aligned_pos = chunk_data_start_pos + chunk_size + (chunk_size % 2);

        match &chunk_id {
            b"fmt " => {
                let mut fmt_data = vec![0; chunk_size as usize];
                reader.read_exact(&mut fmt_data)?;
                format_chunk = Some(parse_fmt_chunk(&fmt_data)?);
            }
            b"data" => {
                data_chunk_info = Some((chunk_data_start_pos, chunk_size));
                // Nothing after the samples matters to playback.
                if format_chunk.is_some() {
                    break;
                }
            }
            _ => {}
        }
        if reader.seek(SeekFrom::Start(next_chunk_aligned_pos)).is_err() {
            break;
        }
    }

    let format = format_chunk
        .ok_or_else(|| anyhow!("File has no 'fmt ' chunk: {:?}", full_path_for_logs))?;
    let (data_offset, data_size) = data_chunk_info
        .ok_or_else(|| anyhow!("File has no 'data' chunk: {:?}", full_path_for_logs))?;

    Ok((format, data_offset, data_size))
}

fn parse_fmt_chunk(data: &[u8]) -> Result<WavFmt> {
    if data.len() < 16 {
        return Err(anyhow!("'fmt ' chunk too short: {} bytes", data.len()));
    }
    let mut cursor = Cursor::new(data);
    let mut audio_format = cursor.read_u16::<LittleEndian>()?;
    let num_channels = cursor.read_u16::<LittleEndian>()?;
    let sample_rate = cursor.read_u32::<LittleEndian>()?;
    cursor.seek(SeekFrom::Start(14))?;
    let bits_per_sample = cursor.read_u16::<LittleEndian>()?;

    if audio_format == FORMAT_EXTENSIBLE {
        // The sub-format GUID starts at offset 24; its first two bytes are the real tag.
        if data.len() < 26 {
            return Err(anyhow!("extensible 'fmt ' chunk too short: {} bytes", data.len()));
        }
        cursor.seek(SeekFrom::Start(24))?;
        audio_format = cursor.read_u16::<LittleEndian>()?;
    }

    Ok(WavFmt {
        audio_format,
        num_channels,
        sample_rate,
        bits_per_sample,
    })
}

/// Frame-addressable reader over a WAV data chunk.
///
/// Every frame comes out as one mono `f32`: the average of the file's channels.
/// Seeking is lazy so a seek followed by another seek costs nothing.
pub struct WavFrameReader<R: Read + Seek> {
    reader: R,
    fmt: WavFmt,
    data_start: u64,
    frames: u64,
    /// Next frame `read_frame` returns.
    frame: u64,
    needs_seek: bool,
}

impl<R: Read + Seek> WavFrameReader<R> {
    pub fn new(mut reader: R, full_path_for_logs: &Path) -> Result<Self> {
        let (fmt, data_start, data_size) = parse_wav_metadata(&mut reader, full_path_for_logs)?;
        fmt.check_supported()?;

        // Streaming writers leave the size field at its maximum; trust the file length instead.
        let file_len = reader.seek(SeekFrom::End(0))?;
        let available = file_len.saturating_sub(data_start).min(data_size);
        let frames = available / fmt.block_align();
        if frames == 0 {
            return Err(anyhow!("File has no audio frames: {:?}", full_path_for_logs));
        }

        log::debug!(
            "[Wav] {:?}: {} ch, {} Hz, {} bit, {} frames",
            full_path_for_logs,
            fmt.num_channels,
            fmt.sample_rate,
            fmt.bits_per_sample,
            frames
        );

        Ok(Self {
            reader,
            fmt,
            data_start,
            frames,
            frame: 0,
            needs_seek: true,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.fmt.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.fmt.num_channels
    }

    pub fn format(&self) -> WavFmt {
        self.fmt
    }

    /// Positions the reader so the next `read_frame` returns `frame`.
    pub fn seek(&mut self, frame: u64) {
        if frame != self.frame {
            self.frame = frame;
            self.needs_seek = true;
        }
    }

    /// Reads the frame at the current position and moves one frame forward.
    /// `Ok(None)` past the last frame.
    pub fn read_frame(&mut self) -> io::Result<Option<f32>> {
        if self.frame >= self.frames {
            return Ok(None);
        }
        if self.needs_seek {
            let offset = self.data_start + self.frame * self.fmt.block_align();
            self.reader.seek(SeekFrom::Start(offset))?;
            self.needs_seek = false;
        }

        let channels = self.fmt.num_channels;
        let mut sum = 0.0f32;
        for _ in 0..channels {
            sum += self.read_sample()?;
        }
        self.frame += 1;
        Ok(Some(sum / channels as f32))
    }

    fn read_sample(&mut self) -> io::Result<f32> {
        let result = match (self.fmt.bits_per_sample, self.fmt.audio_format) {
            (8, _) => self
                .reader
                .read_u8()
                .map(|s| (s as f32 - 128.0) / 128.0),
            (16, _) => self
                .reader
                .read_i16::<LittleEndian>()
                .map(|s| s as f32 / I16_MAX_F),
            (24, _) => self
                .reader
                .read_i24::<LittleEndian>()
                .map(|s| s as f32 / I24_MAX_F),
            (32, FORMAT_IEEE_FLOAT) => self.reader.read_f32::<LittleEndian>(),
            (32, _) => self
                .reader
                .read_i32::<LittleEndian>()
                .map(|s| s as f32 / I32_MAX_F),
            (bits, _) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported bits_per_sample: {bits}"),
            )),
        };
        // Any failed read leaves the underlying cursor somewhere mid-frame.
        if result.is_err() {
            self.needs_seek = true;
        }
        result
    }
}
