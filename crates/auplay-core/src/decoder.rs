//! Audio decoding via Symphonia
//!
//! Opens a local file, decodes it packet by packet into interleaved f32 and
//! seeks accurately within it.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::{ MetadataOptions, StandardTagKey, Tag };
use symphonia::core::probe::{ Hint, ProbedMetadata };
use symphonia::core::units::Time;
use thiserror::Error;


#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "Failed to open file: {0}" )]
    FileOpen( #[from] std::io::Error ),

    #[error( "Unsupported format" )]
    UnsupportedFormat,

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Seek error: {0}" )]
    Seek( String ),
}


pub struct Decoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
    duration: Option<Duration>,
    probe_metadata: ProbedMetadata,
    /// Frames before this timestamp are dropped after an accurate seek.
    skip_until: Option<u64>,
}


impl Decoder {
    pub fn open( path: &Path ) -> Result<Self, DecoderError> {
        let file = File::open( path )?;
        let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions { buffer_len: 64 * 1024 } );

        let mut hint = Hint::new();
        if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
            hint.with_extension( ext );
        }

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| DecoderError::UnsupportedFormat )?;

        let probe_metadata = probed.metadata;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;
        let sample_rate = codec_params.sample_rate.unwrap_or( 44100 );
        let channels = codec_params.channels.map( |c| c.count() ).unwrap_or( 2 );
        let duration = codec_params
            .n_frames
            .map( |frames| Duration::from_secs_f64( frames as f64 / sample_rate as f64 ) );

        tracing::info!(
            "Opened {:?}: {} Hz, {} channels, duration: {:?}",
            path,
            sample_rate,
            channels,
            duration
        );

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        Ok( Self {
            format_reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            sample_buf: None,
            duration,
            probe_metadata,
            skip_until: None,
        })
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> usize {
        self.channels
    }


    /// Stream length, if the container declares it.
    pub fn duration( &self ) -> Option<Duration> {
        self.duration
    }


    /// Stream tags as `(name, value)` pairs, plus the codec.
    pub fn tags( &mut self ) -> Vec<( String, String )> {
        let mut tags = Vec::new();

        if let Some( log ) = self.probe_metadata.get() {
            if let Some( revision ) = log.current() {
                collect_tags( &mut tags, revision.tags() );
            }
        }
        if let Some( revision ) = self.format_reader.metadata().current() {
            collect_tags( &mut tags, revision.tags() );
        }

        if let Some( track ) = self.format_reader.tracks().iter().find( |t| t.id == self.track_id ) {
            let codec = format!( "{:?}", track.codec_params.codec ).replace( "CODEC_TYPE_", "" );
            tags.push(( "audio-codec".to_string(), codec ));
        }
        tags
    }


    /// Decodes the next packet into interleaved samples. `None` at end of stream.
    pub fn decode_next( &mut self ) -> Result<Option<Vec<f32>>, DecoderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) ) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok( None );
                }
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                // Corrupt packet, skip it
                Err( SymphoniaError::DecodeError( _ ) ) => continue,
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            let skip = match self.skip_until {
                Some( until ) if packet.ts() + frames as u64 <= until => continue,
                Some( until ) => until.saturating_sub( packet.ts() ) as usize,
                None => 0,
            };
            self.skip_until = None;

            let sample_buf = match self.sample_buf.take() {
                Some( buf ) if buf.capacity() >= frames => buf,
                _ => SampleBuffer::new( frames as u64, spec ),
            };
            let sample_buf = self.sample_buf.insert( sample_buf );
            sample_buf.copy_interleaved_ref( decoded );

            let channels = spec.channels.count();
            return Ok( Some( sample_buf.samples()[ skip * channels.. ].to_vec() ) );
        }
    }


    /// Seeks accurately to `position` and resets the codec.
    pub fn seek( &mut self, position: Duration ) -> Result<(), DecoderError> {
        let seek_to = SeekTo::Time {
            time: Time::from( position.as_secs_f64() ),
            track_id: Some( self.track_id ),
        };

        let seeked = self.format_reader
            .seek( SeekMode::Accurate, seek_to )
            .map_err( |e| DecoderError::Seek( e.to_string() ) )?;
        self.decoder.reset();
        self.skip_until = ( seeked.actual_ts < seeked.required_ts ).then_some( seeked.required_ts );
        Ok(())
    }
}


fn collect_tags( out: &mut Vec<( String, String )>, tags: &[Tag] ) {
    for tag in tags {
        let name = match tag.std_key {
            Some( StandardTagKey::TrackTitle ) => "title".to_string(),
            Some( StandardTagKey::Artist ) => "artist".to_string(),
            Some( StandardTagKey::Album ) => "album".to_string(),
            Some( StandardTagKey::AlbumArtist ) => "album-artist".to_string(),
            Some( StandardTagKey::Genre ) => "genre".to_string(),
            Some( StandardTagKey::TrackNumber ) => "track-number".to_string(),
            Some( StandardTagKey::Date ) | Some( StandardTagKey::ReleaseDate ) => "date".to_string(),
            _ => tag.key.clone(),
        };
        out.push(( name, tag.value.to_string() ));
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::write_test_wav;


    #[test]
    fn test_open_missing_file() {
        let result = Decoder::open( Path::new( "/nonexistent/auplay/missing.wav" ) );
        assert!( matches!( result, Err( DecoderError::FileOpen( _ ) ) ) );
    }


    #[test]
    fn test_open_garbage_is_unsupported() {
        let path = std::env::temp_dir().join( format!( "auplay-garbage-{}.bin", std::process::id() ) );
        std::fs::write( &path, b"definitely not audio data" ).unwrap();
        let result = Decoder::open( &path );
        let _ = std::fs::remove_file( &path );
        assert!( matches!( result, Err( DecoderError::UnsupportedFormat ) ) );
    }


    #[test]
    fn test_decode_wav_to_end() {
        let path = write_test_wav( "decode", 8000, 800 );
        let mut decoder = Decoder::open( &path ).unwrap();

        assert_eq!( decoder.sample_rate(), 8000 );
        assert_eq!( decoder.channels(), 1 );
        assert_eq!( decoder.duration(), Some( Duration::from_millis( 100 ) ) );

        let mut total = 0;
        while let Some( samples ) = decoder.decode_next().unwrap() {
            assert!( samples.iter().all( |s| s.abs() <= 1.0 ) );
            total += samples.len();
        }
        assert_eq!( total, 800 );
        let _ = std::fs::remove_file( &path );
    }


    #[test]
    fn test_seek_skips_ahead() {
        let path = write_test_wav( "seek", 8000, 8000 );
        let mut decoder = Decoder::open( &path ).unwrap();

        decoder.seek( Duration::from_millis( 500 ) ).unwrap();
        let mut total = 0;
        while let Some( samples ) = decoder.decode_next().unwrap() {
            total += samples.len();
        }
        assert_eq!( total, 4000 );
        let _ = std::fs::remove_file( &path );
    }
}
