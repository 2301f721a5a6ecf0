//! Numeric reply codes, as the three-character strings that go on the wire.
//! Only the ones the daemon emits are listed.

pub(crate) const RPL_WELCOME: &str = "001";
pub(crate) const RPL_YOURHOST: &str = "002";
pub(crate) const RPL_CREATED: &str = "003";
pub(crate) const RPL_MYINFO: &str = "004";
pub(crate) const RPL_MAP: &str = "015";
pub(crate) const RPL_MAPEND: &str = "017";

pub(crate) const RPL_STATSKLINE: &str = "216";
pub(crate) const RPL_ENDOFSTATS: &str = "219";
pub(crate) const RPL_UMODEIS: &str = "221";
pub(crate) const RPL_LUSERCLIENT: &str = "251";
pub(crate) const RPL_LUSEROP: &str = "252";
pub(crate) const RPL_LUSERCHANNELS: &str = "254";
pub(crate) const RPL_LUSERME: &str = "255";
pub(crate) const RPL_ADMINME: &str = "256";
pub(crate) const RPL_ADMINLOC1: &str = "257";
pub(crate) const RPL_ADMINEMAIL: &str = "259";
pub(crate) const RPL_LOCALUSERS: &str = "265";
pub(crate) const RPL_GLOBALUSERS: &str = "266";

pub(crate) const RPL_AWAY: &str = "301";
pub(crate) const RPL_UNAWAY: &str = "305";
pub(crate) const RPL_NOWAWAY: &str = "306";
pub(crate) const RPL_WHOISUSER: &str = "311";
pub(crate) const RPL_WHOISSERVER: &str = "312";
pub(crate) const RPL_WHOISOPERATOR: &str = "313";
pub(crate) const RPL_WHOWASUSER: &str = "314";
pub(crate) const RPL_ENDOFWHO: &str = "315";
pub(crate) const RPL_WHOISIDLE: &str = "317";
pub(crate) const RPL_ENDOFWHOIS: &str = "318";
pub(crate) const RPL_WHOISCHANNELS: &str = "319";
pub(crate) const RPL_CHANNELMODEIS: &str = "324";
pub(crate) const RPL_CREATIONTIME: &str = "329";
pub(crate) const RPL_NOTOPIC: &str = "331";
pub(crate) const RPL_TOPIC: &str = "332";
pub(crate) const RPL_TOPICWHOTIME: &str = "333";
pub(crate) const RPL_INVITING: &str = "341";
pub(crate) const RPL_VERSION: &str = "351";
pub(crate) const RPL_WHOREPLY: &str = "352";
pub(crate) const RPL_NAMREPLY: &str = "353";
pub(crate) const RPL_LINKS: &str = "364";
pub(crate) const RPL_ENDOFLINKS: &str = "365";
pub(crate) const RPL_ENDOFNAMES: &str = "366";
pub(crate) const RPL_BANLIST: &str = "367";
pub(crate) const RPL_ENDOFBANLIST: &str = "368";
pub(crate) const RPL_ENDOFWHOWAS: &str = "369";
pub(crate) const RPL_MOTD: &str = "372";
pub(crate) const RPL_MOTDSTART: &str = "375";
pub(crate) const RPL_ENDOFMOTD: &str = "376";
pub(crate) const RPL_YOUREOPER: &str = "381";
pub(crate) const RPL_REHASHING: &str = "382";
pub(crate) const RPL_TIME: &str = "391";

pub(crate) const ERR_NOSUCHNICK: &str = "401";
pub(crate) const ERR_NOSUCHSERVER: &str = "402";
pub(crate) const ERR_NOSUCHCHANNEL: &str = "403";
pub(crate) const ERR_CANNOTSENDTOCHAN: &str = "404";
pub(crate) const ERR_WASNOSUCHNICK: &str = "406";
pub(crate) const ERR_NORECIPIENT: &str = "411";
pub(crate) const ERR_NOTEXTTOSEND: &str = "412";
pub(crate) const ERR_UNKNOWNCOMMAND: &str = "421";
pub(crate) const ERR_NOMOTD: &str = "422";
pub(crate) const ERR_NONICKNAMEGIVEN: &str = "431";
pub(crate) const ERR_ERRONEUSNICKNAME: &str = "432";
pub(crate) const ERR_NICKNAMEINUSE: &str = "433";
pub(crate) const ERR_USERNOTINCHANNEL: &str = "441";
pub(crate) const ERR_NOTONCHANNEL: &str = "442";
pub(crate) const ERR_USERONCHANNEL: &str = "443";
pub(crate) const ERR_NOTREGISTERED: &str = "451";
pub(crate) const ERR_NEEDMOREPARAMS: &str = "461";
pub(crate) const ERR_ALREADYREGISTRED: &str = "462";
pub(crate) const ERR_PASSWDMISMATCH: &str = "464";
pub(crate) const ERR_YOUREBANNEDCREEP: &str = "465";
pub(crate) const ERR_UNKNOWNMODE: &str = "472";
pub(crate) const ERR_NOPRIVILEGES: &str = "481";
pub(crate) const ERR_CHANOPRIVSNEEDED: &str = "482";
pub(crate) const ERR_UMODEUNKNOWNFLAG: &str = "501";
pub(crate) const ERR_USERSDONTMATCH: &str = "502";
