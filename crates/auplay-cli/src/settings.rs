//! Application settings management
//!
//! Persistent playback settings, stored as JSON in the user's config directory.

use std::fs;
use std::path::{ Path, PathBuf };

use auplay_core::PlaybinOptions;
use serde::{ Deserialize, Serialize };


#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Insert the stereo balance stage
    pub balance_enabled: bool,

    /// Decode-ahead target in milliseconds
    pub buffer_ms: u32,

    /// Initial volume of every player, 0.0 to 1.0
    pub volume: f64,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            balance_enabled: true,
            buffer_ms: 50,
            volume: 1.0,
        }
    }
}


impl Settings {
    /// Returns the default path of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "auplay" ).join( "settings.json" ) )
    }


    /// Loads settings from `path`, or the default location, falling back to defaults.
    pub fn load_from( path: Option<&Path> ) -> Self {
        let path = match path.map( Path::to_path_buf ).or_else( Self::default_path ) {
            Some( p ) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( &path ) {
            Ok( contents ) => serde_json::from_str( &contents ).unwrap_or_else( |e| {
                tracing::warn!( "Ignoring malformed settings {:?}: {}", path, e );
                Self::default()
            }),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Saves settings to `path`, or the default location.
    pub fn save_to( &self, path: Option<&Path> ) -> anyhow::Result<PathBuf> {
        let path = path
            .map( Path::to_path_buf )
            .or_else( Self::default_path )
            .ok_or_else( || anyhow::anyhow!( "No config directory available" ) )?;

        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent )?;
        }
        fs::write( &path, serde_json::to_string_pretty( self )? )?;
        Ok( path )
    }


    pub fn playbin_options( &self ) -> PlaybinOptions {
        PlaybinOptions {
            balance: self.balance_enabled,
            buffer_ms: self.buffer_ms,
            volume: self.volume.clamp( 0.0, 1.0 ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: Settings = serde_json::from_str( r#"{ "volume": 0.5 }"# ).unwrap();
        assert_eq!( settings.volume, 0.5 );
        assert!( settings.balance_enabled );
        assert_eq!( settings.buffer_ms, 50 );
    }


    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::load_from( Some( Path::new( "/nonexistent/auplay/settings.json" ) ) );
        assert_eq!( settings, Settings::default() );
    }


    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join( format!( "auplay-settings-{}.json", std::process::id() ) );
        let settings = Settings { balance_enabled: false, buffer_ms: 80, volume: 0.3 };

        settings.save_to( Some( &path ) ).unwrap();
        let loaded = Settings::load_from( Some( &path ) );
        let _ = fs::remove_file( &path );

        assert_eq!( loaded, settings );
    }


    #[test]
    fn test_playbin_options_clamp_volume() {
        let settings = Settings { volume: 3.0, ..Settings::default() };
        assert_eq!( settings.playbin_options().volume, 1.0 );
    }
}
