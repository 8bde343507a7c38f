//! Thin control surface over one pipeline.
//!
//! Owns the pipeline and the currently bound source URI. Contains no player
//! logic: flags and events live in [`crate::player`].

use std::time::Duration;

use crate::pipeline::{ Pipeline, PipelineError, PipelineState, SeekRequest, StateChange };


/// Result of binding a source URL.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum SourceBinding {
    /// Same non-empty URL as before; nothing was touched.
    Unchanged,
    /// The previous source was dropped and no new one was set.
    Cleared,
    /// A new source was set and the pipeline moved to READY.
    Bound,
}


pub fn clamp_volume( volume: f64 ) -> f64 {
    if volume.is_nan() {
        return 0.0;
    }
    volume.clamp( 0.0, 1.0 )
}


pub fn clamp_balance( balance: f32 ) -> f32 {
    if balance.is_nan() {
        return 0.0;
    }
    balance.clamp( -1.0, 1.0 )
}


fn to_millis( duration: Duration ) -> i64 {
    duration.as_millis().min( i64::MAX as u128 ) as i64
}


pub struct PipelineHandle {
    pipeline: Box<dyn Pipeline>,
    uri: String,
}


impl PipelineHandle {
    pub fn new( pipeline: Box<dyn Pipeline> ) -> Self {
        Self { pipeline, uri: String::new() }
    }


    /// Currently bound source URI; empty when none.
    pub fn uri( &self ) -> &str {
        &self.uri
    }


    pub fn current_state( &self ) -> PipelineState {
        self.pipeline.current_state()
    }


    /// Binds `url` as the pipeline source.
    ///
    /// A different URL stops the pipeline and, when non-empty, sets it and
    /// advances to READY. The readiness itself is reported later on the bus.
    pub fn bind_source( &mut self, url: &str ) -> Result<SourceBinding, PipelineError> {
        if self.uri == url && !url.is_empty() {
            return Ok( SourceBinding::Unchanged );
        }

        self.uri = url.to_string();
        self.pipeline.set_state( PipelineState::Null )?;
        if url.is_empty() {
            return Ok( SourceBinding::Cleared );
        }

        self.pipeline.set_uri( url );
        if self.pipeline.current_state() != PipelineState::Ready {
            self.pipeline.set_state( PipelineState::Ready )?;
        }
        Ok( SourceBinding::Bound )
    }


    /// Drops the source and forces the pipeline to NULL. Safe to call repeatedly.
    pub fn release_source( &mut self ) -> Result<(), PipelineError> {
        self.uri.clear();
        if self.pipeline.current_state() > PipelineState::Null {
            self.pipeline.set_state( PipelineState::Null )?;
        }
        Ok(())
    }


    pub fn set_state( &mut self, state: PipelineState ) -> Result<StateChange, PipelineError> {
        self.pipeline.set_state( state )
    }


    /// Blocks until the pipeline reports a settled state.
    pub fn wait_settled( &mut self ) -> Result<PipelineState, PipelineError> {
        self.pipeline.wait_settled()
    }


    /// Sends a seek for `position_ms` at `rate`. False when the pipeline refused it.
    pub fn seek_or_set_rate( &mut self, position_ms: i64, rate: f64 ) -> bool {
        self.pipeline.send_seek( SeekRequest::new( position_ms, rate ) )
    }


    pub fn query_position( &self ) -> Option<i64> {
        let position = self.pipeline.query_position();
        if position.is_none() {
            tracing::debug!( "Could not query current position." );
        }
        position.map( to_millis )
    }


    pub fn query_duration( &self ) -> Option<i64> {
        let duration = self.pipeline.query_duration();
        if duration.is_none() {
            // Variable bitrate streams may not know their length until played through
            tracing::debug!( "Could not query current duration." );
        }
        duration.map( to_millis )
    }


    pub fn set_volume( &mut self, volume: f64 ) {
        self.pipeline.set_volume( clamp_volume( volume ) );
    }


    /// Applies a clamped balance. Returns false when there is no balance stage.
    pub fn set_balance( &mut self, balance: f32 ) -> bool {
        match self.pipeline.balance_stage() {
            Some( stage ) => {
                stage.set_panorama( clamp_balance( balance ) );
                true
            }
            None => false,
        }
    }


    /// Releases the pipeline: detach bus, detach balance stage, drop the pipeline.
    ///
    /// The source must already be released.
    pub fn teardown( mut self ) {
        self.pipeline.detach_bus();
        self.pipeline.remove_balance_stage();
        drop( self.pipeline );
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::{ Call, MockControl };


    fn handle( balance: bool ) -> ( PipelineHandle, std::sync::Arc<MockControl> ) {
        let ( pipeline, control ) = MockControl::standalone( balance );
        ( PipelineHandle::new( pipeline ), control )
    }


    #[test]
    fn test_volume_is_clamped() {
        let ( mut handle, control ) = handle( true );
        handle.set_volume( -0.5 );
        handle.set_volume( 2.0 );
        handle.set_volume( 0.25 );
        assert_eq!(
            control.calls(),
            vec![ Call::Volume( 0.0 ), Call::Volume( 1.0 ), Call::Volume( 0.25 ) ]
        );
    }


    #[test]
    fn test_balance_is_clamped() {
        let ( mut handle, control ) = handle( true );
        assert!( handle.set_balance( -5.0 ) );
        assert!( handle.set_balance( 5.0 ) );
        assert_eq!( control.calls(), vec![ Call::Balance( -1.0 ), Call::Balance( 1.0 ) ] );
    }


    #[test]
    fn test_balance_without_stage_is_noop() {
        let ( mut handle, control ) = handle( false );
        assert!( !handle.set_balance( 0.5 ) );
        assert!( control.calls().is_empty() );
    }


    #[test]
    fn test_bind_new_source_reaches_ready() {
        let ( mut handle, control ) = handle( true );
        assert_eq!( handle.bind_source( "file:///tmp/a.mp3" ).unwrap(), SourceBinding::Bound );
        assert_eq!( handle.uri(), "file:///tmp/a.mp3" );
        assert_eq!( handle.current_state(), PipelineState::Ready );
        assert_eq!(
            control.calls(),
            vec![
                Call::SetState( PipelineState::Null ),
                Call::SetUri( "file:///tmp/a.mp3".into() ),
                Call::SetState( PipelineState::Ready ),
            ]
        );
    }


    #[test]
    fn test_bind_same_source_is_unchanged() {
        let ( mut handle, control ) = handle( true );
        handle.bind_source( "file:///tmp/a.mp3" ).unwrap();
        let before = control.calls().len();

        assert_eq!( handle.bind_source( "file:///tmp/a.mp3" ).unwrap(), SourceBinding::Unchanged );
        assert_eq!( control.calls().len(), before );
    }


    #[test]
    fn test_bind_empty_source_clears() {
        let ( mut handle, _control ) = handle( true );
        handle.bind_source( "file:///tmp/a.mp3" ).unwrap();
        assert_eq!( handle.bind_source( "" ).unwrap(), SourceBinding::Cleared );
        assert_eq!( handle.current_state(), PipelineState::Null );
        assert_eq!( handle.uri(), "" );
    }


    #[test]
    fn test_release_source_is_idempotent() {
        let ( mut handle, control ) = handle( true );
        handle.bind_source( "file:///tmp/a.mp3" ).unwrap();
        handle.release_source().unwrap();
        let after_first = control.calls().len();
        handle.release_source().unwrap();

        assert_eq!( control.calls().len(), after_first );
        assert_eq!( handle.uri(), "" );
    }


    #[test]
    fn test_failed_query_is_none() {
        let ( handle, control ) = handle( true );
        assert_eq!( handle.query_position(), None );
        control.set_position( Some( Duration::from_millis( 1500 ) ) );
        assert_eq!( handle.query_position(), Some( 1500 ) );
    }


    #[test]
    fn test_teardown_order() {
        let ( handle, control ) = handle( true );
        handle.teardown();
        assert_eq!(
            control.calls(),
            vec![ Call::DetachBus, Call::RemoveBalanceStage, Call::Dropped ]
        );
    }
}
