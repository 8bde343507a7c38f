//! Audio output via cpal
//!
//! A [`SampleBuffer`] sits between the decoding thread and the device
//! callback. Channel remixing, volume and the stereo balance stage are applied
//! on the way out, using the live values in [`MixControls`].

use std::collections::VecDeque;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;


#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get default stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),
}


/// Format of the default output device.
#[derive( Debug, Clone, PartialEq )]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}


/// Looks up the default output device without opening it.
pub fn default_device() -> Result<DeviceInfo, OutputError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or( OutputError::NoDevice )?;
    let config = device
        .default_output_config()
        .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;

    Ok( DeviceInfo {
        name: device.name().unwrap_or_else( |_| "unknown".into() ),
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    })
}


/// Live mix parameters, shared by the pipeline and the device callback.
pub struct MixControls {
    paused: AtomicBool,
    /// f32 bits, 0.0 to 1.0
    volume: AtomicU32,
    /// f32 bits, -1.0 (left) to 1.0 (right)
    balance: AtomicU32,
}


impl MixControls {
    pub fn new( volume: f32 ) -> Self {
        Self {
            paused: AtomicBool::new( true ),
            volume: AtomicU32::new( volume.to_bits() ),
            balance: AtomicU32::new( 0.0_f32.to_bits() ),
        }
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    pub fn set_volume( &self, volume: f32 ) {
        self.volume.store( volume.to_bits(), Ordering::Relaxed );
    }


    pub fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    pub fn set_balance( &self, balance: f32 ) {
        self.balance.store( balance.to_bits(), Ordering::Relaxed );
    }


    pub fn balance( &self ) -> f32 {
        f32::from_bits( self.balance.load( Ordering::Relaxed ) )
    }


    /// Left and right gains for the current volume and balance.
    ///
    /// Panning towards one side attenuates the other; the near side keeps full level.
    pub fn gains( &self ) -> ( f32, f32 ) {
        let volume = self.volume();
        let balance = self.balance();
        let left = if balance > 0.0 { 1.0 - balance } else { 1.0 };
        let right = if balance < 0.0 { 1.0 + balance } else { 1.0 };
        ( volume * left, volume * right )
    }
}


/// Samples queued for the device, in source channel layout at the device rate.
pub struct SampleBuffer {
    buffer: Mutex<VecDeque<f32>>,
    capacity: usize,
    source_channels: usize,
    output_channels: usize,
    controls: Arc<MixControls>,
}


impl SampleBuffer {
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16, controls: Arc<MixControls> ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            source_channels: source_channels.max( 1 ) as usize,
            output_channels: output_channels.max( 1 ) as usize,
            controls,
        }
    }


    fn lock( &self ) -> MutexGuard<'_, VecDeque<f32>> {
        self.buffer.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Queues as many samples as fit. Returns how many were taken.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut buf = self.lock();
        let to_push = samples.len().min( self.capacity.saturating_sub( buf.len() ) );
        buf.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Fills `output` with mixed frames, padding with silence.
    ///
    /// Returns the number of samples written from the queue; 0 while paused.
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        output.fill( 0.0 );
        if self.controls.is_paused() {
            return 0;
        }

        let src_ch = self.source_channels;
        let out_ch = self.output_channels;
        let ( left_gain, right_gain ) = self.controls.gains();

        let mut buf = self.lock();
        let frames = ( output.len() / out_ch ).min( buf.len() / src_ch );
        let mut frame = [ 0.0_f32; 8 ];

        for out_frame in output.chunks_exact_mut( out_ch ).take( frames ) {
            for slot in frame.iter_mut().take( src_ch.min( 8 ) ) {
                *slot = buf.pop_front().unwrap_or( 0.0 );
            }
            // Channels beyond eight are dropped
            for _ in 8..src_ch {
                buf.pop_front();
            }

            if out_ch == 1 {
                let used = src_ch.min( 8 );
                out_frame[ 0 ] = frame[ ..used ].iter().sum::<f32>() / used as f32;
            } else {
                for ( ch, sample ) in out_frame.iter_mut().enumerate() {
                    *sample = frame[ ch.min( src_ch.min( 8 ) - 1 ) ];
                }
            }

            if out_ch >= 2 {
                out_frame[ 0 ] *= left_gain;
                out_frame[ 1 ] *= right_gain;
                for sample in out_frame[ 2.. ].iter_mut() {
                    *sample *= self.controls.volume();
                }
            } else {
                out_frame[ 0 ] *= self.controls.volume();
            }
        }

        frames * out_ch
    }


    /// Number of queued samples.
    pub fn len( &self ) -> usize {
        self.lock().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.lock().is_empty()
    }


    pub fn clear( &self ) {
        self.lock().clear();
    }
}


/// An open cpal output stream.
///
/// Not `Send`: it must stay on the thread that created it.
pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}


impl AudioOutput {
    /// Opens the default device with its default config.
    ///
    /// The returned buffer holds up to `buffer_secs` of audio at the device rate.
    pub fn new(
        source_channels: u16,
        buffer_secs: f32,
        controls: Arc<MixControls>,
    ) -> Result<( Self, Arc<SampleBuffer> ), OutputError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let config = device
            .default_output_config()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .config();

        tracing::info!(
            "Audio output config: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capacity = ( config.sample_rate.0 as f32 * buffer_secs ) as usize * source_channels.max( 1 ) as usize;
        let sample_buffer = Arc::new( SampleBuffer::new( capacity, source_channels, config.channels, controls ) );
        let callback_buffer = Arc::clone( &sample_buffer );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_buffer.pop( data );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        Ok((
            Self {
                stream,
                sample_rate: config.sample_rate.0,
                channels: config.channels,
            },
            sample_buffer,
        ))
    }


    pub fn play( &self ) -> Result<(), OutputError> {
        self.stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> u16 {
        self.channels
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn playing( volume: f32 ) -> Arc<MixControls> {
        let controls = Arc::new( MixControls::new( volume ) );
        controls.set_paused( false );
        controls
    }


    #[test]
    fn test_paused_outputs_silence() {
        let controls = Arc::new( MixControls::new( 1.0 ) );
        let buffer = SampleBuffer::new( 16, 2, 2, controls );
        buffer.push( &[ 0.5; 8 ] );

        let mut out = [ 1.0; 4 ];
        assert_eq!( buffer.pop( &mut out ), 0 );
        assert_eq!( out, [ 0.0; 4 ] );
        assert_eq!( buffer.len(), 8 );
    }


    #[test]
    fn test_push_respects_capacity() {
        let buffer = SampleBuffer::new( 4, 2, 2, playing( 1.0 ) );
        assert_eq!( buffer.push( &[ 0.1; 6 ] ), 4 );
        assert_eq!( buffer.push( &[ 0.1; 2 ] ), 0 );
    }


    #[test]
    fn test_volume_applied() {
        let buffer = SampleBuffer::new( 16, 2, 2, playing( 0.5 ) );
        buffer.push( &[ 1.0, 1.0, 1.0, 1.0 ] );

        let mut out = [ 0.0; 6 ];
        assert_eq!( buffer.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.5, 0.5, 0.5, 0.5, 0.0, 0.0 ] );
    }


    #[test]
    fn test_balance_attenuates_far_side() {
        let controls = playing( 1.0 );
        let buffer = SampleBuffer::new( 16, 2, 2, Arc::clone( &controls ) );

        controls.set_balance( -0.5 );
        buffer.push( &[ 1.0, 1.0 ] );
        let mut out = [ 0.0; 2 ];
        buffer.pop( &mut out );
        assert_eq!( out, [ 1.0, 0.5 ] );

        controls.set_balance( 1.0 );
        buffer.push( &[ 1.0, 1.0 ] );
        buffer.pop( &mut out );
        assert_eq!( out, [ 0.0, 1.0 ] );
    }


    #[test]
    fn test_mono_to_stereo() {
        let buffer = SampleBuffer::new( 16, 1, 2, playing( 1.0 ) );
        buffer.push( &[ 0.25, -0.25 ] );

        let mut out = [ 0.0; 4 ];
        assert_eq!( buffer.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.25, 0.25, -0.25, -0.25 ] );
    }


    #[test]
    fn test_stereo_to_mono() {
        let buffer = SampleBuffer::new( 16, 2, 1, playing( 1.0 ) );
        buffer.push( &[ 0.2, 0.4 ] );

        let mut out = [ 0.0; 1 ];
        assert_eq!( buffer.pop( &mut out ), 1 );
        assert!( ( out[ 0 ] - 0.3 ).abs() < 1e-6 );
    }
}
