//! Read-only WAV access for analyses and playback.
//! The header is validated by walking the RIFF chunks ourselves; sample reads go
//! through `hound`, which handles seeking within the `data` chunk.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::AudioFileError;

const PCM_FORMAT: u16 = 1;
const SUPPORTED_BITS: u16 = 16;

/// Fields of the `fmt ` chunk plus the location of the `data` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Offset of the first sample byte from the start of the file.
    pub data_offset: u64,
    /// Declared length of the `data` chunk in bytes.
    pub data_len: u32,
}

impl WavHeader {
    /// Parse and validate the header. Unknown chunks before `data` are skipped.
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, AudioFileError> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        expect_id(reader, b"RIFF", "RIFF")?;
        let _riff_len = read_u32(reader)?;
        expect_id(reader, b"WAVE", "WAVE")?;

        let mut format: Option<[u8; 16]> = None;
        loop {
            let mut id = [0u8; 4];
            if reader.read_exact(&mut id).is_err() {
                return Err(AudioFileError::MissingChunk(if format.is_none() {
                    "fmt "
                } else {
                    "data"
                }));
            }
            let len = read_u32(reader)?;
            match &id {
                b"fmt " => {
                    if len < 16 {
                        return Err(AudioFileError::MissingChunk("fmt "));
                    }
                    let mut body = [0u8; 16];
                    reader.read_exact(&mut body)?;
                    skip(reader, u64::from(len - 16) + u64::from(len % 2))?;
                    format = Some(body);
                }
                b"data" => {
                    let body = format.ok_or(AudioFileError::MissingChunk("fmt "))?;
                    let data_offset = reader.stream_position()?;
                    let header = Self::from_format(&body, data_offset, len)?;
                    let available = file_len.saturating_sub(data_offset);
                    if u64::from(len) > available {
                        return Err(AudioFileError::Truncated {
                            declared: u64::from(len),
                            available,
                        });
                    }
                    return Ok(header);
                }
                _ => skip(reader, u64::from(len) + u64::from(len % 2))?,
            }
        }
    }

    fn from_format(body: &[u8; 16], data_offset: u64, data_len: u32) -> Result<Self, AudioFileError> {
        let u16_at = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
        let header = Self {
            audio_format: u16_at(0),
            channels: u16_at(2),
            sample_rate: u32_at(4),
            byte_rate: u32_at(8),
            block_align: u16_at(12),
            bits_per_sample: u16_at(14),
            data_offset,
            data_len,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), AudioFileError> {
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(AudioFileError::Unsupported(format!(
                "{} channels at {} Hz",
                self.channels, self.sample_rate
            )));
        }
        // Header fields are untrusted: widen before multiplying.
        let bytes_per_sample = u64::from(self.bits_per_sample / 8);
        let expected_rate = u64::from(self.sample_rate) * u64::from(self.channels) * bytes_per_sample;
        if u64::from(self.byte_rate) != expected_rate {
            return Err(AudioFileError::InconsistentByteRate {
                actual: self.byte_rate,
                expected: expected_rate,
            });
        }
        let expected_align = u32::from(self.channels) * u32::from(self.bits_per_sample / 8);
        if u32::from(self.block_align) != expected_align {
            return Err(AudioFileError::InconsistentBlockAlign {
                actual: self.block_align,
                expected: expected_align,
            });
        }
        if self.audio_format != PCM_FORMAT || self.bits_per_sample != SUPPORTED_BITS {
            return Err(AudioFileError::Unsupported(format!(
                "format {} with {} bits per sample",
                self.audio_format, self.bits_per_sample
            )));
        }
        Ok(())
    }

    pub fn frame_count(&self) -> u64 {
        u64::from(self.data_len) / u64::from(self.block_align.max(1))
    }
}

fn expect_id<R: Read>(reader: &mut R, expected: &[u8; 4], name: &'static str) -> Result<(), AudioFileError> {
    let mut id = [0u8; 4];
    reader
        .read_exact(&mut id)
        .map_err(|_| AudioFileError::MissingChunk(name))?;
    if &id != expected {
        return Err(AudioFileError::MissingChunk(name));
    }
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, AudioFileError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn skip<R: Seek>(reader: &mut R, bytes: u64) -> Result<(), AudioFileError> {
    reader.seek(SeekFrom::Current(bytes as i64))?;
    Ok(())
}

/// Random-access handle over a validated 16-bit PCM WAV file.
pub struct AudioFile {
    path: PathBuf,
    header: WavHeader,
    reader: Mutex<hound::WavReader<BufReader<File>>>,
}

impl AudioFile {
    pub fn open(path: &Path) -> Result<Self, AudioFileError> {
        let mut file = File::open(path)?;
        let header = WavHeader::read_from(&mut file)?;
        let reader = hound::WavReader::open(path)?;
        debug!(
            path = %path.display(),
            sample_rate = header.sample_rate,
            channels = header.channels,
            frames = header.frame_count(),
            "audio file opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &WavHeader {
        &self.header
    }

    pub fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.header.channels
    }

    pub fn frame_count(&self) -> u64 {
        self.header.frame_count()
    }

    /// Length of the sample data in bytes.
    pub fn data_len(&self) -> u64 {
        u64::from(self.header.data_len)
    }

    /// Up to `count` interleaved frames starting at frame `start`.
    /// Reads past the end are clipped; a start beyond the end yields nothing.
    pub fn read_frames(&self, start: u64, count: usize) -> Result<Vec<i16>, AudioFileError> {
        let total = self.frame_count();
        if start >= total || count == 0 {
            return Ok(Vec::new());
        }
        let frames = (count as u64).min(total - start) as usize;
        let channels = usize::from(self.header.channels);
        let mut reader = self.reader.lock();
        reader.seek(start as u32)?;
        let samples = reader
            .samples::<i16>()
            .take(frames * channels)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// Every sample of one channel, de-interleaved.
    pub fn read_channel(&self, channel: u16) -> Result<Vec<i16>, AudioFileError> {
        if channel >= self.header.channels {
            return Err(AudioFileError::Unsupported(format!(
                "channel {channel} of {}",
                self.header.channels
            )));
        }
        let all = self.read_frames(0, self.frame_count() as usize)?;
        Ok(all
            .iter()
            .skip(usize::from(channel))
            .step_by(usize::from(self.header.channels))
            .copied()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Write a 16-bit PCM file with `hound`.
    pub(crate) fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spike_recorder_wav_{}_{name}.wav", std::process::id()))
    }

    fn header_bytes(byte_rate: u32, block_align: u16, data: &[u8], declared: u32) -> Vec<u8> {
        format_bytes(1, 10_000, byte_rate, block_align, data, declared)
    }

    fn format_bytes(
        channels: u16,
        sample_rate: u32,
        byte_rate: u32,
        block_align: u16,
        data: &[u8],
        declared: u32,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + declared).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"LIST");
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&declared.to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn header_skips_unknown_chunks() {
        let bytes = header_bytes(20_000, 2, &[1, 0, 2, 0], 4);
        let header = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.sample_rate, 10_000);
        assert_eq!(header.data_offset, 56);
        assert_eq!(header.frame_count(), 2);
    }

    #[test]
    fn inconsistent_byte_rate_is_rejected() {
        let bytes = header_bytes(12_345, 2, &[0; 4], 4);
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, AudioFileError::InconsistentByteRate { actual: 12_345, expected: 20_000 }));
    }

    #[test]
    fn inconsistent_block_align_is_rejected() {
        let bytes = header_bytes(20_000, 4, &[0; 4], 4);
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, AudioFileError::InconsistentBlockAlign { .. }));
    }

    #[test]
    fn oversized_rate_fields_are_rejected_not_overflowed() {
        let bytes = format_bytes(2, u32::MAX, 0, 4, &[], 0);
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err,
            AudioFileError::InconsistentByteRate { actual: 0, expected } if expected == u64::from(u32::MAX) * 4
        ));

        let bytes = format_bytes(u16::MAX, 10_000, 1_310_700_000, 4, &[], 0);
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err,
            AudioFileError::InconsistentBlockAlign { actual: 4, expected: 131_070 }
        ));
    }

    #[test]
    fn zero_channels_are_rejected_before_rate_checks() {
        let bytes = format_bytes(0, 10_000, 20_000, 2, &[], 0);
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, AudioFileError::Unsupported(_)));
    }

    #[test]
    fn short_data_chunk_is_truncated() {
        let bytes = header_bytes(20_000, 2, &[0; 4], 400);
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, AudioFileError::Truncated { declared: 400, available: 4 }));
    }

    #[test]
    fn wrong_riff_id_is_rejected() {
        let mut bytes = header_bytes(20_000, 2, &[0; 4], 4);
        bytes[0..4].copy_from_slice(b"RIFX");
        let err = WavHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, AudioFileError::MissingChunk("RIFF")));
    }

    #[test]
    fn frames_are_read_and_clipped() {
        let path = temp_path("frames");
        let samples: Vec<i16> = (0..20).collect();
        write_wav(&path, 10_000, 2, &samples);

        let file = AudioFile::open(&path).unwrap();
        assert_eq!(file.channels(), 2);
        assert_eq!(file.frame_count(), 10);
        assert_eq!(file.read_frames(8, 5).unwrap(), vec![16, 17, 18, 19]);
        assert!(file.read_frames(10, 5).unwrap().is_empty());
        assert_eq!(file.read_channel(1).unwrap(), (0..10).map(|i| 2 * i + 1).collect::<Vec<i16>>());
        let _ = std::fs::remove_file(&path);
    }
}
